//! Job lifecycle.
//!
//! A job boots its executor, exports environment variables, injects files,
//! runs the main command list fail-fast, runs the epilogue command groups,
//! and tears down: callbacks, the final `job_finished` event, and in pull
//! mode a wait for the log collector to acknowledge the archive. A concurrent
//! stop request flips a flag and fires the executor's kill switch; the run
//! loop observes the flag at every command boundary.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::{Command, EnvVar, JobRequest, LoggerMethod};
use crate::config::HostEnvVar;
use crate::errors::{Error, Result};
use crate::eventlogger::Logger;
use crate::executors::{create_executor, Executor};
use crate::retry::{retry_with_constant_wait, RetryOptions};
use crate::shell::KillSwitch;

/// Exported into the session before the epilogues so they can react to the
/// outcome of the main command list.
pub const JOB_RESULT_VAR: &str = "SEMAPHORE_JOB_RESULT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Passed,
    Failed,
    Stopped,
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobResult::Passed => "passed",
            JobResult::Failed => "failed",
            JobResult::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

pub struct RunOptions {
    /// Host-level environment variables, exported on top of the ones carried
    /// by the request. These win on conflict.
    pub envs: Vec<HostEnvVar>,
    pub callback_retry_attempts: u32,
    pub callback_retry_delay: Duration,
    pub archive_poll_attempts: u32,
    pub archive_poll_delay: Duration,
}

impl Default for RunOptions {
    fn default() -> RunOptions {
        RunOptions {
            envs: Vec::new(),
            callback_retry_attempts: 60,
            callback_retry_delay: Duration::from_secs(1),
            archive_poll_attempts: 120,
            archive_poll_delay: Duration::from_secs(1),
        }
    }
}

pub struct Job {
    pub request: JobRequest,
    pub logger: Logger,
    executor: Box<dyn Executor>,
    options: RunOptions,
    client: reqwest::Client,
    stopped: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    log_archived: Arc<AtomicBool>,
}

/// Cloneable handle for stopping a job from another task. It never touches
/// the job's streams; it only flips the stop flag and fires the kill switch.
pub struct JobStopper {
    stopped: Arc<AtomicBool>,
    kill: KillSwitch,
}

impl JobStopper {
    pub fn stop(&self) {
        info!("stopping job");
        self.stopped.store(true, Ordering::SeqCst);

        let kill = self.kill.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || kill.fire()));
        if outcome.is_err() {
            error!("panic while firing the kill switch");
        }
    }
}

impl Job {
    pub fn new(request: JobRequest, logger: Logger) -> Result<Job> {
        Job::with_options(request, logger, RunOptions::default())
    }

    pub fn with_options(request: JobRequest, logger: Logger, options: RunOptions) -> Result<Job> {
        let executor = create_executor(&request)?;

        Ok(Job {
            request,
            logger,
            executor,
            options,
            client: reqwest::Client::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            log_archived: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stopper(&self) -> JobStopper {
        JobStopper {
            stopped: self.stopped.clone(),
            kill: self.executor.kill_switch(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Flag the log collector sets once it has archived all job events; in
    /// pull mode teardown waits for it before closing the logger.
    pub fn log_archived_handle(&self) -> Arc<AtomicBool> {
        self.log_archived.clone()
    }

    pub async fn run(&mut self) {
        info!("job {} started", self.request.id);
        self.logger.log_job_started();

        let mut result = JobResult::Failed;
        if self.boot_executor().await {
            result = self.run_regular_commands().await;
            debug!("regular commands finished: {result}");
            self.handle_epilogues(result).await;
        }

        if let Err(e) = self.teardown(result).await {
            error!("job teardown failed: {e}");
        }

        // the stop path already tore the executor down
        if !self.stopped() {
            self.executor.stop().await;
        }
        self.executor.cleanup().await;
        self.finished.store(true, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn boot_executor(&mut self) -> bool {
        if self.executor.prepare().await != 0 {
            error!("executor failed to prepare");
            return false;
        }

        if self.executor.start().await != 0 {
            error!("executor failed to boot up");
            return false;
        }

        true
    }

    async fn run_regular_commands(&mut self) -> JobResult {
        let exit_code = self
            .executor
            .export_env_vars(&self.request.env_vars, &self.options.envs, &mut self.logger)
            .await;
        if exit_code != 0 {
            return JobResult::Failed;
        }

        let exit_code = self
            .executor
            .inject_files(&self.request.files, &mut self.logger)
            .await;
        if exit_code != 0 {
            return JobResult::Failed;
        }

        let mut last_exit_code = 0;
        for command in &self.request.commands {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            last_exit_code = self
                .executor
                .run_command(&command.directive, false, &command.alias, &mut self.logger)
                .await;
            if last_exit_code != 0 {
                break;
            }
        }

        if self.stopped() {
            JobResult::Stopped
        } else if last_exit_code == 0 {
            JobResult::Passed
        } else {
            JobResult::Failed
        }
    }

    async fn handle_epilogues(&mut self, result: JobResult) {
        self.export_job_result(result).await;

        let always = self.request.epilogue_always_commands.clone();
        self.run_epilogue_commands(&always).await;

        let conditional = if result == JobResult::Passed {
            self.request.epilogue_on_pass_commands.clone()
        } else {
            self.request.epilogue_on_fail_commands.clone()
        };
        self.run_epilogue_commands(&conditional).await;
    }

    /// The result is exported even for stopped jobs, so that an epilogue
    /// already underway when the stop landed sees a value.
    async fn export_job_result(&mut self, result: JobResult) {
        let var = EnvVar {
            name: JOB_RESULT_VAR.to_string(),
            value: BASE64.encode(result.to_string()),
        };

        self.executor
            .export_env_vars(&[var], &[], &mut self.logger)
            .await;
    }

    /// Epilogue groups are fail-fast like the main list, and a stop skips the
    /// whole group or breaks out between commands.
    async fn run_epilogue_commands(&mut self, commands: &[Command]) {
        for command in commands {
            if self.stopped() {
                return;
            }

            let exit_code = self
                .executor
                .run_command(&command.directive, false, &command.alias, &mut self.logger)
                .await;
            if exit_code != 0 {
                return;
            }
        }
    }

    async fn teardown(&mut self, mut result: JobResult) -> Result<()> {
        // a stop that landed during the epilogues still changes the result
        if self.stopped() {
            result = JobResult::Stopped;
        }

        if self.request.callbacks.finished.is_empty() {
            self.logger.log_job_finished(result);
            if let Err(e) = self.logger.close() {
                error!("error closing logger: {e}");
            }
            return Ok(());
        }

        let finished_outcome = self.send_finished_callback(result).await;
        if let Err(e) = &finished_outcome {
            error!("could not send finished callback: {e}");
        }
        self.logger.log_job_finished(result);

        if self.request.logger.method == LoggerMethod::Pull {
            self.wait_for_archived_logs().await;
        }

        if let Err(e) = self.logger.close() {
            error!("error closing logger: {e}");
        }

        self.send_teardown_finished_callback().await?;

        info!("job teardown finished");
        finished_outcome
    }

    async fn wait_for_archived_logs(&self) {
        let archived = self.log_archived.clone();
        let outcome = retry_with_constant_wait(
            RetryOptions {
                task: "waiting for job logs to be archived",
                max_attempts: self.options.archive_poll_attempts,
                delay_between_attempts: self.options.archive_poll_delay,
                hide_errors: true,
            },
            || {
                let archived = archived.clone();
                async move {
                    if archived.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err("logs are not archived yet")
                    }
                }
            },
        )
        .await;

        if outcome.is_err() {
            warn!("giving up on waiting for logs to be archived");
        }
    }

    async fn send_finished_callback(&self, result: JobResult) -> Result<()> {
        let payload = serde_json::json!({ "result": result.to_string() });
        self.send_callback(&self.request.callbacks.finished, payload)
            .await
    }

    async fn send_teardown_finished_callback(&self) -> Result<()> {
        self.send_callback(&self.request.callbacks.teardown_finished, serde_json::json!({}))
            .await
    }

    async fn send_callback(&self, url: &str, payload: serde_json::Value) -> Result<()> {
        debug!("sending callback to {url}");

        retry_with_constant_wait(
            RetryOptions {
                task: "sending callback",
                max_attempts: self.options.callback_retry_attempts,
                delay_between_attempts: self.options.callback_retry_delay,
                hide_errors: false,
            },
            || {
                let mut request = self.client.post(url).json(&payload);
                if !self.request.callbacks.token.is_empty() {
                    request = request.bearer_auth(&self.request.callbacks.token);
                }

                let url = url.to_string();
                async move {
                    let response = request.send().await?;
                    if !response.status().is_success() {
                        return Err(Error::CallbackStatus {
                            url,
                            status: response.status().as_u16(),
                        });
                    }

                    Ok(())
                }
            },
        )
        .await
    }
}
