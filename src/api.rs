//! Job request model.
//!
//! A job request describes everything the agent needs to run one job: the
//! command lists, environment variables and files to inject (both carried
//! base64-encoded), the epilogue command groups, and the callback URLs hit
//! during teardown.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub executor: String,

    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub epilogue_always_commands: Vec<Command>,
    #[serde(default)]
    pub epilogue_on_pass_commands: Vec<Command>,
    #[serde(default)]
    pub epilogue_on_fail_commands: Vec<Command>,

    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub callbacks: Callbacks,
    #[serde(default)]
    pub logger: LoggerSpec,
}

impl JobRequest {
    pub fn from_json(content: &[u8]) -> Result<JobRequest> {
        Ok(serde_json::from_slice(content)?)
    }

    pub fn find_env_var(&self, name: &str) -> Option<&EnvVar> {
        self.env_vars.iter().find(|v| v.name == name)
    }
}

/// One shell command from a job's command list. When `alias` is set, events
/// about the command carry the alias instead of the raw directive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub directive: String,
    #[serde(default)]
    pub alias: String,
}

impl Command {
    pub fn new(directive: &str) -> Command {
        Command {
            directive: directive.to_string(),
            alias: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    /// Base64-encoded value.
    pub value: String,
}

impl EnvVar {
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64.decode(&self.value).map_err(|_| Error::InvalidBase64 {
            name: self.name.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    /// Base64-encoded content.
    pub content: String,
    /// Octal mode string, e.g. "0644".
    pub mode: String,
}

impl File {
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64.decode(&self.content).map_err(|_| Error::InvalidBase64 {
            name: self.path.clone(),
        })
    }

    /// Resolves the destination path: absolute paths are kept, `~` expands to
    /// the home directory, and relative paths are joined onto it.
    pub fn normalize_path(&self, home: &Path) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_absolute() {
            return path.to_path_buf();
        }

        if let Some(stripped) = self.path.strip_prefix("~/") {
            return home.join(stripped);
        }

        home.join(path)
    }

    pub fn parse_mode(&self) -> Result<u32> {
        u32::from_str_radix(&self.mode, 8).map_err(|_| Error::BadFileMode(self.mode.clone()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Callbacks {
    #[serde(default)]
    pub finished: String,
    #[serde(default)]
    pub teardown_finished: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggerSpec {
    #[serde(default)]
    pub method: LoggerMethod,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

/// How job events leave the agent. `Pull` means an external archiver collects
/// them and acknowledges collection during teardown; anything else closes the
/// logger directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggerMethod {
    #[default]
    Pull,
    Push,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_request_from_json() {
        let content = br#"{
            "id": "ddb714bd-3ecb-4a76-9fc6-b155a3f2bf0f",
            "executor": "shell",
            "commands": [{"directive": "echo hello"}],
            "env_vars": [{"name": "A", "value": "Zm9v"}],
            "callbacks": {"finished": "https://x/finished", "teardown_finished": "https://x/done"},
            "logger": {"method": "push"}
        }"#;

        let request = JobRequest::from_json(content).expect("parse error");
        assert_eq!(request.executor, "shell");
        assert_eq!(request.commands.len(), 1);
        assert_eq!(request.logger.method, LoggerMethod::Push);
        assert_eq!(request.find_env_var("A").map(|v| v.value.as_str()), Some("Zm9v"));
        assert!(request.find_env_var("B").is_none());
    }

    #[test]
    fn logger_method_defaults_to_pull() {
        let request = JobRequest::from_json(b"{}").expect("parse error");
        assert_eq!(request.logger.method, LoggerMethod::Pull);
    }

    #[test]
    fn env_var_values_are_base64() {
        let var = EnvVar {
            name: "A".to_string(),
            value: "aGVsbG8=".to_string(),
        };
        assert_eq!(var.decode().expect("decode error"), b"hello");

        let bad = EnvVar {
            name: "B".to_string(),
            value: "???".to_string(),
        };
        assert!(bad.decode().is_err());
    }

    #[test]
    fn file_paths_resolve_against_home() {
        let home = Path::new("/home/agent");
        let abs = File {
            path: "/etc/motd".into(),
            ..Default::default()
        };
        let tilde = File {
            path: "~/one.txt".into(),
            ..Default::default()
        };
        let relative = File {
            path: "a/b.txt".into(),
            ..Default::default()
        };

        assert_eq!(abs.normalize_path(home), PathBuf::from("/etc/motd"));
        assert_eq!(tilde.normalize_path(home), PathBuf::from("/home/agent/one.txt"));
        assert_eq!(relative.normalize_path(home), PathBuf::from("/home/agent/a/b.txt"));
    }

    #[test]
    fn file_modes_are_octal_strings() {
        let file = File {
            mode: "0644".into(),
            ..Default::default()
        };
        assert_eq!(file.parse_mode().expect("mode"), 0o644);

        let bad = File {
            mode: "rw-".into(),
            ..Default::default()
        };
        assert!(bad.parse_mode().is_err());
    }
}
