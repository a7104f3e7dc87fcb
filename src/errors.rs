use std::result;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to boot shell session: {0}")]
    Boot(String),
    #[error("shell session closed")]
    SessionClosed,
    #[error("shell session has not been started")]
    SessionNotStarted,
    #[error("unknown executor type {0:?}")]
    UnknownExecutor(String),
    #[error("invalid base64 value for {name}")]
    InvalidBase64 { name: String },
    #[error("bad file permission {0:?}")]
    BadFileMode(String),
    #[error("callback to {url} got HTTP {status}")]
    CallbackStatus { url: String, status: u16 },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = result::Result<T, Error>;
