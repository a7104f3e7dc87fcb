//! Host-resident job agent library.
//!
//! A [`jobs::Job`] is built from an [`api::JobRequest`], runs its command
//! lists through an [`executors::Executor`] (a persistent interactive shell
//! session by default), and reports progress as an ordered stream of
//! [`eventlogger::Event`]s. Jobs can be stopped from another task through a
//! [`jobs::JobStopper`].

pub mod api;
pub mod config;
pub mod errors;
pub mod eventlogger;
pub mod executors;
pub mod jobs;
pub mod retry;
pub mod shell;

pub use errors::{Error, Result};
pub use jobs::{Job, JobResult, JobStopper, RunOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::JobRequest;
    use crate::eventlogger::default_test_logger;

    #[tokio::test]
    async fn basic() {
        let request = JobRequest::from_json(
            br#"{
                "id": "ddb714bd-3ecb-4a76-9fc6-b155a3f2bf0f",
                "executor": "shell",
                "commands": [
                    {"directive": "echo hello world"},
                    {"directive": "export A=1"},
                    {"directive": "echo $A$A"}
                ]
            }"#,
        )
        .expect("request");

        let (logger, backend) = default_test_logger();
        let mut job = Job::new(request, logger).expect("job");
        job.run().await;

        assert!(job.is_finished());
        assert_eq!(backend.output_for("echo hello world"), "hello world\n");
        assert_eq!(backend.output_for("echo $A$A"), "11\n");
        assert_eq!(
            backend.simplified_events(false).last().map(String::as_str),
            Some("job_finished: passed")
        );
    }
}
