//! Job event log.
//!
//! The engine reports progress as an ordered stream of events: one
//! `job_started`, then for every executed directive a `cmd_started`, zero or
//! more `cmd_output` chunks and one `cmd_finished`, and finally a
//! `job_finished` carrying the result. Persistence is a [`Backend`] concern;
//! the engine only ever talks to [`Logger`].

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::error;

use crate::errors::Result;
use crate::jobs::JobResult;

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    JobStarted {
        timestamp: u64,
    },
    JobFinished {
        timestamp: u64,
        result: JobResult,
    },
    CmdStarted {
        timestamp: u64,
        directive: String,
    },
    CmdOutput {
        timestamp: u64,
        output: String,
    },
    CmdFinished {
        timestamp: u64,
        directive: String,
        exit_code: i32,
        started_at: u64,
        finished_at: u64,
    },
}

pub trait Backend: Send + Sync {
    fn open(&mut self) -> Result<()>;
    fn write(&mut self, event: Event) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub struct Logger {
    backend: Box<dyn Backend>,
}

impl Logger {
    pub fn new(mut backend: Box<dyn Backend>) -> Result<Logger> {
        backend.open()?;
        Ok(Logger { backend })
    }

    pub fn log_job_started(&mut self) {
        self.write(Event::JobStarted {
            timestamp: now_unix(),
        });
    }

    pub fn log_job_finished(&mut self, result: JobResult) {
        self.write(Event::JobFinished {
            timestamp: now_unix(),
            result,
        });
    }

    pub fn log_command_started(&mut self, directive: &str) {
        self.write(Event::CmdStarted {
            timestamp: now_unix(),
            directive: directive.to_string(),
        });
    }

    pub fn log_command_output(&mut self, output: &str) {
        self.write(Event::CmdOutput {
            timestamp: now_unix(),
            output: output.to_string(),
        });
    }

    pub fn log_command_finished(
        &mut self,
        directive: &str,
        exit_code: i32,
        started_at: u64,
        finished_at: u64,
    ) {
        self.write(Event::CmdFinished {
            timestamp: now_unix(),
            directive: directive.to_string(),
            exit_code,
            started_at,
            finished_at,
        });
    }

    pub fn close(&mut self) -> Result<()> {
        self.backend.close()
    }

    fn write(&mut self, event: Event) {
        if let Err(e) = self.backend.write(event) {
            error!("failed to write event: {e}");
        }
    }
}

/// Keeps events in memory. The test double for every job test; production
/// backends (file, push-over-HTTP) live with the embedding agent.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    events: Arc<Mutex<Vec<Event>>>,
}

impl InMemoryBackend {
    pub fn new() -> InMemoryBackend {
        InMemoryBackend::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event log lock poisoned").clone()
    }

    /// One short line per event, in order. Output events are included only
    /// when `include_output` is set.
    pub fn simplified_events(&self, include_output: bool) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Event::JobStarted { .. } => Some("job_started".to_string()),
                Event::JobFinished { result, .. } => Some(format!("job_finished: {result}")),
                Event::CmdStarted { directive, .. } => Some(format!("directive: {directive}")),
                Event::CmdOutput { output, .. } => {
                    include_output.then(|| output.clone())
                }
                Event::CmdFinished { exit_code, .. } => Some(format!("Exit Code: {exit_code}")),
            })
            .collect()
    }

    /// Concatenates the output emitted between a directive's started and
    /// finished events.
    pub fn output_for(&self, directive: &str) -> String {
        let mut inside = false;
        let mut output = String::new();
        for event in self.events() {
            match event {
                Event::CmdStarted { directive: d, .. } => inside = d == directive,
                Event::CmdOutput { output: chunk, .. } if inside => output.push_str(&chunk),
                Event::CmdFinished { directive: d, .. } if d == directive => break,
                _ => {}
            }
        }
        output
    }
}

impl Backend for InMemoryBackend {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, event: Event) -> Result<()> {
        self.events.lock().expect("event log lock poisoned").push(event);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logger + backend pair for tests; the backend handle stays readable after
/// the logger is moved into a job.
pub fn default_test_logger() -> (Logger, InMemoryBackend) {
    let backend = InMemoryBackend::new();
    let logger = Logger::new(Box::new(backend.clone())).expect("in-memory backend cannot fail");
    (logger, backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_recorded_in_order() {
        let (mut logger, backend) = default_test_logger();

        logger.log_job_started();
        logger.log_command_started("echo hello");
        logger.log_command_output("hello\n");
        logger.log_command_finished("echo hello", 0, 1, 2);
        logger.log_job_finished(JobResult::Passed);

        assert_eq!(
            backend.simplified_events(true),
            vec![
                "job_started",
                "directive: echo hello",
                "hello\n",
                "Exit Code: 0",
                "job_finished: passed",
            ]
        );

        assert_eq!(
            backend.simplified_events(false),
            vec![
                "job_started",
                "directive: echo hello",
                "Exit Code: 0",
                "job_finished: passed",
            ]
        );
    }

    #[test]
    fn output_is_aggregated_per_directive() {
        let (mut logger, backend) = default_test_logger();
        logger.log_command_started("cat file");
        logger.log_command_output("one ");
        logger.log_command_output("two\n");
        logger.log_command_finished("cat file", 0, 1, 2);

        assert_eq!(backend.output_for("cat file"), "one two\n");
        assert_eq!(backend.output_for("other"), "");
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = Event::CmdFinished {
            timestamp: 10,
            directive: "ls".to_string(),
            exit_code: 0,
            started_at: 9,
            finished_at: 10,
        };

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "cmd_finished");
        assert_eq!(json["exit_code"], 0);
    }
}
