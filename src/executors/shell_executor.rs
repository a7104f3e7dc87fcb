use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use crate::api::{EnvVar, File};
use crate::config::HostEnvVar;
use crate::errors::Result;
use crate::eventlogger::{now_unix, Logger};
use crate::executors::Executor;
use crate::shell::{Environment, KillSwitch, Process, Shell};

const ENV_EXPORT_DIRECTIVE: &str = "Exporting environment variables";
const FILE_INJECTION_DIRECTIVE: &str = "Injecting Files";

/// Runs a job directly on the host, inside one persistent `bash --login`
/// session. Environment variables are exported by sourcing a generated env
/// file into the session, so they persist for every later directive.
pub struct ShellExecutor {
    shell: Shell,
    env_file: PathBuf,
}

impl ShellExecutor {
    pub fn new(job_id: &str) -> Result<ShellExecutor> {
        let tag = if job_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            job_id.to_string()
        };

        Ok(ShellExecutor {
            shell: Shell::new(&["bash", "--login"])?,
            env_file: std::env::temp_dir().join(format!(".env-{tag}")),
        })
    }

    async fn run(
        &mut self,
        directive: &str,
        silent: bool,
        alias: &str,
        logger: &mut Logger,
    ) -> i32 {
        let label = if alias.is_empty() { directive } else { alias };

        if !silent {
            logger.log_command_started(label);
            if !alias.is_empty() {
                logger.log_command_output(&format!("Running: {directive}\n"));
            }
        }

        let mut process = Process::new(directive);
        let outcome = {
            let mut on_output = |chunk: &str| {
                if !silent {
                    logger.log_command_output(chunk);
                }
            };
            process.run(&mut self.shell, &mut on_output).await
        };

        if let Err(e) = outcome {
            // the session went away under the directive, typically a stop
            debug!("directive interrupted: {e}");
        }

        if !silent {
            logger.log_command_finished(
                label,
                process.exit_code,
                process.started_at,
                process.finished_at,
            );
        }

        process.exit_code
    }

    fn write_file(&self, file: &File, destination: &Path) -> Result<()> {
        let content = file.decode()?;
        let mode = file.parse_mode()?;

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(destination, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(destination, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn prepare(&mut self) -> i32 {
        0
    }

    async fn start(&mut self) -> i32 {
        match self.shell.start().await {
            Ok(()) => 0,
            Err(e) => {
                error!("failed to start shell session: {e}");
                1
            }
        }
    }

    async fn export_env_vars(
        &mut self,
        env_vars: &[EnvVar],
        host_env_vars: &[HostEnvVar],
        logger: &mut Logger,
    ) -> i32 {
        let started_at = now_unix();
        logger.log_command_started(ENV_EXPORT_DIRECTIVE);

        let exit_code = match Environment::from_request(env_vars, host_env_vars) {
            Ok(env) => {
                for name in env.keys() {
                    logger.log_command_output(&format!("Exporting {name}\n"));
                }

                match env.to_file(&self.env_file) {
                    Ok(()) => {
                        let source = format!("source {}", self.env_file.display());
                        self.run(&source, true, "", logger).await
                    }
                    Err(e) => {
                        logger.log_command_output(&format!(
                            "Failed to write environment file: {e}\n"
                        ));
                        1
                    }
                }
            }
            Err(e) => {
                logger.log_command_output(&format!("{e}\n"));
                1
            }
        };

        logger.log_command_finished(ENV_EXPORT_DIRECTIVE, exit_code, started_at, now_unix());
        exit_code
    }

    async fn inject_files(&mut self, files: &[File], logger: &mut Logger) -> i32 {
        let started_at = now_unix();
        logger.log_command_started(FILE_INJECTION_DIRECTIVE);

        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let mut exit_code = 0;
        for file in files {
            let destination = file.normalize_path(&home);
            logger.log_command_output(&format!(
                "Injecting {} with file mode {}\n",
                destination.display(),
                file.mode
            ));

            if let Err(e) = self.write_file(file, &destination) {
                logger.log_command_output(&format!("{e}\n"));
                exit_code = 1;
                break;
            }
        }

        logger.log_command_finished(FILE_INJECTION_DIRECTIVE, exit_code, started_at, now_unix());
        exit_code
    }

    async fn run_command(
        &mut self,
        directive: &str,
        silent: bool,
        alias: &str,
        logger: &mut Logger,
    ) -> i32 {
        self.run(directive, silent, alias, logger).await
    }

    async fn stop(&mut self) -> i32 {
        self.shell.close();
        0
    }

    async fn cleanup(&mut self) -> i32 {
        let _ = std::fs::remove_file(&self.env_file);
        0
    }

    fn kill_switch(&self) -> KillSwitch {
        self.shell.kill_switch()
    }
}
