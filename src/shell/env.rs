use std::collections::btree_map;
use std::collections::BTreeMap;
use std::path::Path;

use crate::api::EnvVar;
use crate::config::HostEnvVar;
use crate::errors::Result;

/// The shell session's environment: an ordered name→value mapping holding
/// raw (already decoded) values. Keys are unique; a later `set` overwrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    env: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    /// Builds an environment from job-request variables (base64-encoded) and
    /// host-level variables (used verbatim). Host variables win on conflict.
    pub fn from_request(env_vars: &[EnvVar], host_env_vars: &[HostEnvVar]) -> Result<Environment> {
        let mut env = Environment::new();
        for var in env_vars {
            let value = var.decode()?;
            env.set(&var.name, &String::from_utf8_lossy(&value));
        }

        for var in host_env_vars {
            env.set(&var.name, &var.value);
        }

        Ok(env)
    }

    /// Parses an environment dump file with one `NAME=VALUE` line per
    /// variable, as produced by `env` after a no-PTY directive.
    pub fn from_dump(file_name: &Path) -> Result<Environment> {
        let contents = std::fs::read_to_string(file_name)?;
        let contents = contents.trim().replace("\r\n", "\n");

        let mut env = Environment::new();
        for line in contents.split('\n') {
            if let Some((name, value)) = line.split_once('=') {
                env.set(name, value);
            }
        }

        Ok(env)
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.env.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) {
        self.env.remove(name);
    }

    pub fn keys(&self) -> Vec<String> {
        self.env.keys().cloned().collect()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.env.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
    }

    /// Merges `other` into this environment, overwriting existing entries.
    pub fn append(&mut self, other: &Environment) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    pub fn to_slice(&self) -> Vec<String> {
        self.iter().map(|(n, v)| format!("{n}={v}")).collect()
    }

    pub fn to_commands(&self) -> Vec<String> {
        self.iter()
            .map(|(n, v)| format!("export {}={}\n", n, shell_quote(v)))
            .collect()
    }

    /// Writes the environment as a shell file with one `export NAME=VALUE`
    /// line per variable, sorted by name, values shell-quoted.
    pub fn to_file(&self, file_name: &Path) -> Result<()> {
        std::fs::write(file_name, self.to_commands().concat())?;
        Ok(())
    }
}

/// Quotes a value for a `export NAME=VALUE` line. Values made only of safe
/// characters pass through; everything else is single-quoted with embedded
/// quotes escaped as `'"'"'`.
pub fn shell_quote(s: &str) -> String {
    fn safe(c: char) -> bool {
        c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
    }

    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars().all(safe) {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    fn encoded(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: BASE64.encode(value),
        }
    }

    #[test]
    fn request_vars_are_decoded_and_host_vars_used_verbatim() {
        let env = Environment::from_request(
            &[encoded("A", "foo"), encoded("B", "bar")],
            &[HostEnvVar {
                name: "C".to_string(),
                value: "plain".to_string(),
            }],
        )
        .expect("env");

        assert_eq!(env.get("A"), Some("foo"));
        assert_eq!(env.get("B"), Some("bar"));
        assert_eq!(env.get("C"), Some("plain"));
    }

    #[test]
    fn later_set_overwrites() {
        let mut env = Environment::new();
        env.set("A", "one");
        env.set("A", "two");
        assert_eq!(env.get("A"), Some("two"));
        assert_eq!(env.keys(), vec!["A".to_string()]);
    }

    #[test]
    fn serializes_to_sorted_export_lines() {
        let mut env = Environment::new();
        env.set("Z", "ZZZ");
        env.set("O", "OOO");
        env.set("QUOTED", "This is going to get quoted");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".env");
        env.to_file(&path).expect("write");

        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            content,
            "export O=OOO\nexport QUOTED='This is going to get quoted'\nexport Z=ZZZ\n"
        );
    }

    #[test]
    fn quoting_rules() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("simple-value_1.0"), "simple-value_1.0");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn dump_files_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dump.env.after");
        std::fs::write(&path, "A=1\r\nB=two=2\r\nmalformed line\r\nC=\r\n").expect("write");

        let env = Environment::from_dump(&path).expect("parse");
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some("two=2"));
        assert_eq!(env.get("C"), Some(""));
        assert_eq!(env.keys().len(), 3);
    }

    #[test]
    fn append_overwrites_and_extends() {
        let mut base = Environment::new();
        base.set("A", "1");
        base.set("B", "2");

        let mut update = Environment::new();
        update.set("B", "20");
        update.set("C", "30");

        base.append(&update);
        assert_eq!(base.to_slice(), vec!["A=1", "B=20", "C=30"]);
    }
}
