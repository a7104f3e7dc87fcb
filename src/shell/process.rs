use std::path::PathBuf;
use std::process::Stdio;

use bytes::{Buf, BytesMut};
use futures::future::FutureExt;
use regex::bytes::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::eventlogger::now_unix;
use crate::shell::{Environment, OutputBuffer, Shell};

/// Fixed prefix combined with the current time to form per-process markers.
const MARKER_MAGIC: &str = "c7e255b1";

/// Out-of-band byte prefixing every marker line on the stream.
const MARKER_HEADER: u8 = 0x01;

/// Bytes read from the session per read call.
const READ_CHUNK_LENGTH: usize = 100;

/// Sentinel variables added by the no-PTY wrapper script and stripped from
/// the environment dump before it replaces the session's snapshot.
const CURRENT_DIR_VAR: &str = "SEMAPHORE_AGENT_CURRENT_DIR";
const EXIT_STATUS_VAR: &str = "SEMAPHORE_AGENT_CURRENT_CMD_EXIT_STATUS";

/// One directive execution inside a shell session.
///
/// The directive is written to a temporary file (multi-line directives and
/// quoting would corrupt the framing instruction if inlined) and wrapped in
/// start/end markers; the scanner then recovers its output and exit status
/// from the otherwise unstructured byte stream.
pub struct Process {
    command: String,
    pub exit_code: i32,
    pub started_at: u64,
    pub finished_at: u64,
    start_mark: String,
    end_mark: String,
    command_end_regex: Regex,
    cmd_file_path: PathBuf,
    input_buffer: BytesMut,
    output_buffer: OutputBuffer,
    read_chunk_length: usize,
}

impl Process {
    pub fn new(command: &str) -> Process {
        let seed = format!("{}-{}", MARKER_MAGIC, now_unix());
        let start_mark = format!("{seed}-start");
        let end_mark = format!("{seed}-end");
        let command_end_regex = Regex::new(&format!(r"{end_mark} (\d+)[\r\n]+"))
            .expect("end marker pattern is a fixed shape");

        Process {
            command: command.to_string(),
            exit_code: 1,
            started_at: 0,
            finished_at: 0,
            start_mark,
            end_mark,
            command_end_regex,
            cmd_file_path: std::env::temp_dir().join(format!("agent-cmd-{}", Uuid::new_v4())),
            input_buffer: BytesMut::new(),
            output_buffer: OutputBuffer::new(),
            read_chunk_length: READ_CHUNK_LENGTH,
        }
    }

    /// Simulates the worst kind of baud rate: tiny reads force the scanner to
    /// handle markers split across arbitrary boundaries.
    #[cfg(test)]
    pub(crate) fn with_read_chunk_length(mut self, length: usize) -> Process {
        self.read_chunk_length = length;
        self
    }

    /// Runs the directive to completion. `exit_code` stays at its failure
    /// default unless a well-formed end marker (or wait status) says
    /// otherwise; a read failure before the end marker is the caller's signal
    /// that the session was torn down underneath the directive.
    pub async fn run(
        &mut self,
        shell: &mut Shell,
        on_output: &mut (dyn FnMut(&str) + Send),
    ) -> Result<()> {
        self.started_at = now_unix();
        let result = if shell.uses_pty() {
            self.run_with_pty(shell, on_output).await
        } else {
            self.run_without_pty(shell, on_output).await
        };
        self.finished_at = now_unix();
        result
    }

    async fn run_with_pty(
        &mut self,
        shell: &mut Shell,
        on_output: &mut (dyn FnMut(&str) + Send),
    ) -> Result<()> {
        tokio::fs::write(&self.cmd_file_path, &self.command).await?;

        let instruction = self.shell_instruction();
        shell.write_line(&instruction).await?;

        let result = self.scan(shell, on_output).await;
        let _ = tokio::fs::remove_file(&self.cmd_file_path).await;
        result
    }

    //
    // The framing instruction:
    //
    //   1. emit the start marker behind the out-of-band header byte
    //   2. source the command file
    //   3. capture its exit status
    //   4. emit the end marker together with that status
    //   5. re-raise the status through a sub-shell so it stays the
    //      instruction's own status
    //
    fn shell_instruction(&self) -> String {
        format!(
            r#"echo -e "\001 {}"; source {}; AGENT_CMD_RESULT=$?; echo -e "\001 {} $AGENT_CMD_RESULT"; echo "exit $AGENT_CMD_RESULT" | sh"#,
            self.start_mark,
            self.cmd_file_path.display(),
            self.end_mark,
        )
    }

    async fn scan(
        &mut self,
        shell: &mut Shell,
        on_output: &mut (dyn FnMut(&str) + Send),
    ) -> Result<()> {
        debug!("scan started");

        self.wait_for_start_marker(shell).await?;

        let exit_status;
        loop {
            if let Some(header_ix) = self.marker_header_index() {
                if header_ix > 0 {
                    // everything before the marker header is ordinary output
                    self.flush_input_until(header_ix);
                }

                if let Some(digits) = self.match_end_marker() {
                    exit_status = digits;
                    break;
                }

                //
                // The buffered region starts the header but does not match
                // the full end marker yet. Once it is longer than the end
                // marker by a safety margin it cannot be one, and holding it
                // back any further would starve the output stream.
                //
                if self.input_buffer.len() >= self.end_mark.len() + 10 {
                    self.flush_input_all();
                }
            } else {
                self.flush_input_all();
            }

            self.stream(&mut *on_output);

            if let Err(e) = self.read(shell).await {
                // The session died underneath the directive, most likely a
                // stop or an `exit` that took the boot process with it.
                self.output_buffer.drain(&mut *on_output);
                return Err(e);
            }
        }

        self.output_buffer.drain(&mut *on_output);

        debug!("command output finished, parsing exit status {exit_status:?}");
        match exit_status.parse::<i32>() {
            Ok(code) => self.exit_code = code,
            Err(e) => {
                warn!("error parsing exit status {exit_status:?}: {e}");
                on_output("Failed to read command exit code\n");
            }
        }

        Ok(())
    }

    /// Discards stream bytes until the start-marker line has been seen;
    /// nothing before it belongs to the directive's output.
    async fn wait_for_start_marker(&mut self, shell: &mut Shell) -> Result<()> {
        debug!("waiting for start marker {}", self.start_mark);

        let needle = format!("{}\r\n", self.start_mark);
        loop {
            self.read(shell).await?;

            if let Some(ix) = find_subsequence(&self.input_buffer, needle.as_bytes()) {
                self.input_buffer.advance(ix + needle.len());
                debug!("start marker found {}", self.start_mark);
                return Ok(());
            }
        }
    }

    fn marker_header_index(&self) -> Option<usize> {
        self.input_buffer.iter().position(|&b| b == MARKER_HEADER)
    }

    fn match_end_marker(&mut self) -> Option<String> {
        let captures = self.command_end_regex.captures(&self.input_buffer)?;
        let digits = captures.get(1)?;
        Some(String::from_utf8_lossy(digits.as_bytes()).into_owned())
    }

    fn flush_input_until(&mut self, index: usize) {
        let data = self.input_buffer.split_to(index);
        self.output_buffer.append(&data);
    }

    fn flush_input_all(&mut self) {
        let len = self.input_buffer.len();
        self.flush_input_until(len);
    }

    fn stream(&mut self, on_output: &mut (dyn FnMut(&str) + Send)) {
        while let Some(chunk) = self.output_buffer.flush() {
            debug!("stream to output: {chunk:?}");
            on_output(&chunk);
        }
    }

    async fn read(&mut self, shell: &mut Shell) -> Result<()> {
        let mut buf = vec![0u8; self.read_chunk_length];
        let n = shell.read(&mut buf).await?;
        self.input_buffer.extend_from_slice(&buf[..n]);
        Ok(())
    }

    //
    // Without a PTY there is no persistent process to inject into. Each
    // directive runs in its own subprocess through a wrapper script that
    // captures the exit status, the post-execution working directory, and
    // the full post-execution environment to a side file; the session's
    // tracked state is replaced from that dump so `cd` and `export` persist
    // to the next directive.
    //
    async fn run_without_pty(
        &mut self,
        shell: &mut Shell,
        on_output: &mut (dyn FnMut(&str) + Send),
    ) -> Result<()> {
        let dump_path = PathBuf::from(format!("{}.env.after", self.cmd_file_path.display()));
        let script = format!(
            "{}\n{}=$?\nexport {}=\"$PWD\"\nexport {}\nenv > \"{}\"\nexit ${}\n",
            self.command,
            EXIT_STATUS_VAR,
            CURRENT_DIR_VAR,
            EXIT_STATUS_VAR,
            dump_path.display(),
            EXIT_STATUS_VAR,
        );
        tokio::fs::write(&self.cmd_file_path, script).await?;

        let mut child = Command::new("bash")
            .arg(&self.cmd_file_path)
            .current_dir(&shell.cwd)
            .envs(shell.env.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                error!("error starting command: {e}");
                e
            })?;

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, chunk_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, chunk_tx.clone());
        }
        drop(chunk_tx);

        let mut kill_rx = shell.kill_switch().arm().fuse();
        loop {
            tokio::select! {
                maybe_chunk = chunk_rx.recv() => match maybe_chunk {
                    Some(chunk) => {
                        self.output_buffer.append(&chunk);
                        self.stream(&mut *on_output);
                    }
                    // both output pipes reached end-of-file
                    None => break,
                },
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                }
            }
        }

        match child.wait().await {
            Ok(status) => match status.code() {
                Some(code) => self.exit_code = code,
                None => warn!("wait status {status} cannot be interpreted as an exit code"),
            },
            Err(e) => error!("error waiting for command: {e}"),
        }

        self.output_buffer.drain(&mut *on_output);

        match Environment::from_dump(&dump_path) {
            Ok(mut after) => {
                if let Some(new_cwd) = after.get(CURRENT_DIR_VAR).map(PathBuf::from) {
                    shell.chdir(&new_cwd);
                }
                after.remove(CURRENT_DIR_VAR);
                after.remove(EXIT_STATUS_VAR);
                shell.update_environment(after);
            }
            // the command may have been killed before the dump was written
            Err(e) => debug!("no environment dump after command: {e}"),
        }

        let _ = tokio::fs::remove_file(&self.cmd_file_path).await;
        let _ = tokio::fs::remove_file(&dump_path).await;

        if shell.kill_switch().fired() {
            return Err(Error::SessionClosed);
        }

        Ok(())
    }
}

/// Background read loop feeding raw output chunks to the scanner. The
/// channel closing signals end-of-file.
fn pump(
    mut source: impl AsyncReadExt + Unpin + Send + 'static,
    tx: mpsc::UnboundedSender<bytes::Bytes>,
) {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match source.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {
                    if tx.send(buf.split().freeze()).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
