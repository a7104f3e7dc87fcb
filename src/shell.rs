//! The command execution engine: a persistent interactive shell session
//! ([`session::Shell`]), per-directive execution over a marker protocol
//! ([`process::Process`]), the output flush policy
//! ([`output_buffer::OutputBuffer`]) and the session environment model
//! ([`env::Environment`]).

mod env;
mod output_buffer;
mod process;
mod session;

pub use env::Environment;
pub use output_buffer::{OutputBuffer, DEFAULT_CUT_LENGTH, MAX_TIME_SINCE_LAST_APPEND};
pub use process::Process;
pub use session::{pty_supported, KillSwitch, Shell};
