//! Executors run the framed operations of a job (environment export, file
//! injection, directives) against some execution backend and report every
//! outcome as an exit code. The only backend shipped here drives a local
//! shell session; the trait is the seam for container-based ones.

mod shell_executor;

pub use shell_executor::ShellExecutor;

use async_trait::async_trait;

use crate::api::{EnvVar, File, JobRequest};
use crate::config::HostEnvVar;
use crate::errors::{Error, Result};
use crate::eventlogger::Logger;
use crate::shell::KillSwitch;

pub const EXECUTOR_TYPE_SHELL: &str = "shell";

/// Every operation after boot is reported through the event log as a framed
/// command: zero means success, anything else aborts the phase the job is in.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn prepare(&mut self) -> i32;
    async fn start(&mut self) -> i32;

    async fn export_env_vars(
        &mut self,
        env_vars: &[EnvVar],
        host_env_vars: &[HostEnvVar],
        logger: &mut Logger,
    ) -> i32;

    async fn inject_files(&mut self, files: &[File], logger: &mut Logger) -> i32;

    /// Runs one directive. `silent` suppresses all events for it; `alias`,
    /// when non-empty, replaces the directive in the events.
    async fn run_command(
        &mut self,
        directive: &str,
        silent: bool,
        alias: &str,
        logger: &mut Logger,
    ) -> i32;

    async fn stop(&mut self) -> i32;
    async fn cleanup(&mut self) -> i32;

    /// Handle for the concurrent stop path; firing it interrupts whatever
    /// directive is currently running.
    fn kill_switch(&self) -> KillSwitch;
}

impl std::fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Executor")
    }
}

pub fn create_executor(request: &JobRequest) -> Result<Box<dyn Executor>> {
    match request.executor.as_str() {
        "" | EXECUTOR_TYPE_SHELL => Ok(Box::new(ShellExecutor::new(&request.id)?)),
        other => Err(Error::UnknownExecutor(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_type_defaults_to_shell() {
        let request = JobRequest::default();
        assert!(create_executor(&request).is_ok());
    }

    #[test]
    fn unknown_executor_types_are_rejected() {
        let request = JobRequest {
            executor: "mainframe".to_string(),
            ..Default::default()
        };

        let err = create_executor(&request).expect_err("should be rejected");
        assert!(err.to_string().contains("mainframe"));
    }
}
