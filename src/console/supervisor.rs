//! Supervision of one external process.
//!
//! A [`Supervisor`] launches the process described by a [`Loader`] and runs
//! two pumps:
//! - the output pump reads stdout line by line into a bounded queue and,
//!   once the process exits or the pipe closes, records the terminal error
//!   in a single-slot holder
//! - the input pump drains a bounded command queue into stdin
//!
//! Closing stops both pumps. It does not kill the process; [`SupervisorHandle::kill`]
//! does that explicitly.

use std::process::Stdio;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::ConsoleConfig;
use crate::core::packet::MAX_STRING_LEN;
use crate::error::{Error, Result};
use crate::program::Loader;

/// Cloneable control side of a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<String>,
    stop: CancellationToken,
    kill: CancellationToken,
    pid: Option<u32>,
}

impl SupervisorHandle {
    /// Queue one line for the process's stdin, waiting for room.
    pub async fn send(&self, command: String) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(Error::Process("input pump stopped".into()));
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Process("input pump stopped".into()))
    }

    /// Stop forwarding in both directions. Idempotent.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Kill the process and stop forwarding.
    pub fn kill(&self) {
        self.kill.cancel();
        self.stop.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Owner of one running process's output stream.
#[derive(Debug)]
pub struct Supervisor {
    lines: mpsc::Receiver<String>,
    exit: mpsc::Receiver<Error>,
    handle: SupervisorHandle,
}

impl Supervisor {
    /// Launch the loader's command and start both pumps.
    #[instrument(skip_all, fields(path = %loader.path().display()))]
    pub fn spawn(loader: &dyn Loader, config: &ConsoleConfig) -> Result<Self> {
        let (program, args) = loader.cmd();
        debug!(program = %program.display(), ?args, "Launching process");

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(loader.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to launch {}: {e}", program.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("stdout was not captured".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("stdin was not captured".into()))?;

        let (line_tx, lines) = mpsc::channel(config.line_capacity.max(1));
        let (exit_tx, exit) = mpsc::channel(1);
        let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));

        let handle = SupervisorHandle {
            commands,
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            pid: child.id(),
        };

        tokio::spawn(output_pump(child, stdout, line_tx, exit_tx, handle.clone()));
        tokio::spawn(input_pump(stdin, command_rx, handle.stop.clone()));

        Ok(Self {
            lines,
            exit,
            handle,
        })
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Next output line, or the terminal error once output is exhausted.
    ///
    /// Returns `None` at end of stream.
    pub async fn line(&mut self) -> Option<Result<String>> {
        if let Some(line) = self.lines.recv().await {
            return Some(Ok(line));
        }
        self.exit.recv().await.map(Err)
    }
}

async fn output_pump(
    mut child: Child,
    stdout: ChildStdout,
    line_tx: mpsc::Sender<String>,
    exit_tx: mpsc::Sender<Error>,
    handle: SupervisorHandle,
) {
    let mut lines = FramedRead::new(stdout, ConsoleLineCodec::new(MAX_STRING_LEN));
    let mut killed = false;

    let failure = loop {
        tokio::select! {
            biased;
            _ = handle.kill.cancelled(), if !killed => {
                killed = true;
                kill_child(&mut child);
            }
            _ = handle.stop.cancelled() => break None,
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    tokio::select! {
                        _ = handle.stop.cancelled() => break None,
                        sent = line_tx.send(line) => {
                            if sent.is_err() {
                                break None;
                            }
                        }
                    }
                }
                Some(Err(e)) => break Some(e),
                None => break wait_exit(&mut child, &handle, &mut killed).await,
            },
        }
    };

    if handle.kill.is_cancelled() && !killed {
        kill_child(&mut child);
    }

    drop(line_tx);
    if let Some(error) = failure {
        let _ = exit_tx.try_send(error);
    }
    handle.stop.cancel();
}

fn kill_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill process");
    }
}

/// Wait for the process after its stdout closed, still honouring kill and
/// stop. A killed process is reaped and reports no failure.
async fn wait_exit(
    child: &mut Child,
    handle: &SupervisorHandle,
    killed: &mut bool,
) -> Option<Error> {
    loop {
        tokio::select! {
            biased;
            _ = handle.kill.cancelled(), if !*killed => {
                *killed = true;
                kill_child(child);
            }
            _ = handle.stop.cancelled(), if !handle.kill.is_cancelled() => return None,
            status = child.wait() => {
                return match status {
                    _ if *killed => None,
                    Ok(status) if status.success() => None,
                    Ok(status) => Some(Error::Process(format!("process exited with {status}"))),
                    Err(e) => Some(Error::Io(e)),
                };
            }
        }
    }
}

/// Splits process output into lines.
///
/// Bytes that are not UTF-8 are replaced rather than rejected, a trailing
/// `\r` is dropped, and a line longer than `max_len` bytes is cut into
/// several lines so a process that never prints a newline cannot grow the
/// buffer without bound.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleLineCodec {
    max_len: usize,
    scanned: usize,
}

impl ConsoleLineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            scanned: 0,
        }
    }

    fn take(&mut self, src: &mut BytesMut, len: usize) -> String {
        self.scanned = 0;
        let raw = src.split_to(len);
        let mut line: &[u8] = &raw;
        if let Some(rest) = line.strip_suffix(b"\n") {
            line = rest;
        }
        if let Some(rest) = line.strip_suffix(b"\r") {
            line = rest;
        }
        String::from_utf8_lossy(line).into_owned()
    }
}

impl Decoder for ConsoleLineCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let newline = src[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|at| self.scanned + at);

        match newline {
            Some(at) if at <= self.max_len => Ok(Some(self.take(src, at + 1))),
            _ if src.len() >= self.max_len => Ok(Some(self.take(src, self.max_len))),
            _ => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let len = src.len();
        Ok(Some(self.take(src, len)))
    }
}

async fn input_pump(
    mut stdin: ChildStdin,
    mut command_rx: mpsc::Receiver<String>,
    stop: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = stop.cancelled() => break,
            command = command_rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let mut line = command.into_bytes();
        line.push(b'\n');
        if let Err(e) = write_line(&mut stdin, &line).await {
            warn!(error = %e, "Failed to write to process stdin");
            break;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}
