use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::shell::Environment;

/// Whether the platform can attach the boot process to a pseudo-terminal.
pub fn pty_supported() -> bool {
    cfg!(unix)
}

/// Destructive cancellation switch for a session's boot process.
///
/// Cloneable so a concurrent stop path can fire it without holding any
/// reference to the session itself; the session (re-)arms it with the oneshot
/// that reaches the process supervisor. Firing before anything is armed is
/// remembered, so a later arm trips immediately.
#[derive(Clone, Default)]
pub struct KillSwitch {
    armed: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    fired: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn new() -> KillSwitch {
        KillSwitch::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let armed = self
            .armed
            .lock()
            .expect("kill switch lock poisoned")
            .take();
        if let Some(tx) = armed {
            let _ = tx.send(());
        }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub(crate) fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.fired() {
            let _ = tx.send(());
        } else {
            *self.armed.lock().expect("kill switch lock poisoned") = Some(tx);
        }
        rx
    }
}

/// One persistent, addressable command execution context.
///
/// In PTY mode the boot command (`bash --login`) runs attached to a
/// pseudo-terminal and every directive is injected into that one process. On
/// platforms without a PTY the session instead tracks an explicit working
/// directory and environment snapshot, updated after every directive, which
/// emulates the persistent-session semantics.
pub struct Shell {
    boot_command: Vec<String>,
    no_pty: bool,
    pub cwd: PathBuf,
    pub env: Environment,
    kill: KillSwitch,
    reader: Option<pty_process::OwnedReadPty>,
    writer: Option<pty_process::OwnedWritePty>,
    exit_rx: Option<watch::Receiver<Option<String>>>,
}

impl Shell {
    pub fn new(boot_command: &[&str]) -> Result<Shell> {
        Shell::with_mode(boot_command, !pty_supported())
    }

    pub fn with_mode(boot_command: &[&str], no_pty: bool) -> Result<Shell> {
        if boot_command.is_empty() {
            return Err(Error::Boot("empty boot command".to_string()));
        }

        Ok(Shell {
            boot_command: boot_command.iter().map(|s| s.to_string()).collect(),
            no_pty,
            cwd: std::env::current_dir()?,
            env: Environment::new(),
            kill: KillSwitch::new(),
            reader: None,
            writer: None,
            exit_rx: None,
        })
    }

    pub fn uses_pty(&self) -> bool {
        !self.no_pty
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    /// Boots the session. In PTY mode this spawns the boot process on a
    /// pseudo-terminal and primes it; directives must not be run unless this
    /// returns `Ok`.
    pub async fn start(&mut self) -> Result<()> {
        if self.no_pty {
            return Ok(());
        }

        debug!("starting stateful shell");

        let (pty, pts) = pty_process::open().map_err(|e| Error::Boot(e.to_string()))?;
        let child = pty_process::Command::new(&self.boot_command[0])
            .args(&self.boot_command[1..])
            .spawn(pts)
            .map_err(|e| Error::Boot(format!("{}: {e}", self.boot_command[0])))?;

        let (read_half, write_half) = pty.into_split();
        self.reader = Some(read_half);
        self.writer = Some(write_half);
        self.exit_rx = Some(supervise(child, self.kill.arm()));

        self.silence_prompt_and_disable_ps1().await
    }

    /// Reads session output, failing as soon as the boot process is gone.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let reader = self.reader.as_mut().ok_or(Error::SessionNotStarted)?;
        let exit_rx = self.exit_rx.as_mut().ok_or(Error::SessionNotStarted)?;

        tokio::select! {
            biased;
            result = reader.read(buf) => match result {
                Ok(0) => Err(Error::SessionClosed),
                Ok(n) => Ok(n),
                Err(e) => Err(Error::Io(e)),
            },
            _ = exit_rx.changed() => Err(Error::SessionClosed),
        }
    }

    pub async fn write_line(&mut self, instruction: &str) -> Result<()> {
        debug!("sending instruction: {instruction}");
        self.write_raw(&format!("{instruction}\n")).await
    }

    async fn write_raw(&mut self, data: &str) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(Error::SessionNotStarted)?;
        writer.write_all(data.as_bytes()).await?;
        Ok(())
    }

    /// Closes the stream handle and terminates the boot process tree. Both
    /// steps are attempted regardless of each other.
    pub fn close(&mut self) {
        debug!("closing shell session");
        self.writer.take();
        self.reader.take();
        self.kill.fire();
    }

    pub fn chdir(&mut self, new_cwd: &Path) {
        if new_cwd != self.cwd {
            self.cwd = new_cwd.to_path_buf();
        }
    }

    pub fn update_environment(&mut self, env: Environment) {
        self.env = env;
    }

    //
    // The terminal is still echoing while this runs, so the echoed commands
    // come back on the stream too. Lines containing `echo` are skipped and
    // only the ready sentinel produced by the final echo ends the wait.
    //
    async fn silence_prompt_and_disable_ps1(&mut self) -> Result<()> {
        let ready_mark = format!("ready-{}", Uuid::new_v4().simple());

        self.write_raw("export PS1=''\n").await?;
        self.write_raw("stty -echo\n").await?;
        self.write_raw("echo stty `stty -g` > /tmp/restore-tty\n").await?;
        self.write_raw("cd ~\n").await?;
        self.write_raw(&format!("echo '{ready_mark}'\n")).await?;

        debug!("waiting for shell session initialization");

        let mut pending = String::new();
        let mut buf = [0u8; 256];
        loop {
            let n = self.read(&mut buf).await?;
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            while let Some(ix) = pending.find('\n') {
                let line: String = pending.drain(..=ix).collect();
                let line = line.trim_end();
                debug!("(tty) {line}");
                if !line.contains("echo") && line.contains(&ready_mark) {
                    return Ok(());
                }
            }
        }
    }
}

/// Hands the boot process to a supervisor task: the kill switch forces
/// termination, and the returned channel reports the process's exit. This is
/// the only path by which the concurrent stop handle touches the session.
fn supervise(
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
) -> watch::Receiver<Option<String>> {
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut kill_rx = kill_rx.fuse();
        loop {
            tokio::select! {
                _ = &mut kill_rx => {
                    let _ = child.kill().await;
                }
                status = child.wait() => {
                    let message = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    debug!("shell session closed: {message}");
                    let _ = exit_tx.send(Some(message));
                    break;
                }
            }
        }
    });

    exit_rx
}
