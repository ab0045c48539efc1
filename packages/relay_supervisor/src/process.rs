//! The managed encoder process.
//!
//! [`ProcessLauncher`] starts a program and hands back a [`LaunchedProcess`]:
//! a line stream from stderr, a one-shot exit notification and a
//! [`ProcessControl`] for signalling. The supervisor never touches OS
//! process APIs directly.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::progress::LineSplitter;

/// Program and arguments for one encoder run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    /// Command line with every occurrence of `secret` masked, for logs.
    pub fn display_redacted(&self, secret: &str) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if !secret.is_empty() && arg.contains(secret) {
                parts.push(arg.replace(secret, "****"));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

/// How a process ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// Signalling side of a running process.
pub trait ProcessControl: Send + Sync {
    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&self) -> Result<(), ProcessError>;
    /// Force the process down.
    fn kill(&self) -> Result<(), ProcessError>;
}

/// A started process.
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    /// Diagnostic output, already split into lines
    pub output: mpsc::Receiver<String>,
    /// Resolves once the process has been reaped
    pub exit: oneshot::Receiver<ProcessExit>,
    pub control: Box<dyn ProcessControl>,
}

impl fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, command: &EncoderCommand) -> Result<LaunchedProcess, ProcessError>;
}

/// Launches real OS processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Terminate,
    Kill,
}

/// Signals are delivered by the task that owns the child, and only while it
/// has not been reaped, so the pid they target is still the encoder's.
struct TokioControl {
    signal_tx: mpsc::Sender<StopSignal>,
}

impl TokioControl {
    fn send(&self, signal: StopSignal) -> Result<(), ProcessError> {
        match self.signal_tx.try_send(signal) {
            Ok(()) => Ok(()),
            // Earlier stop requests are still queued
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProcessError::ProcessExited),
        }
    }
}

impl ProcessControl for TokioControl {
    fn terminate(&self) -> Result<(), ProcessError> {
        self.send(StopSignal::Terminate)
    }

    fn kill(&self) -> Result<(), ProcessError> {
        self.send(StopSignal::Kill)
    }
}

/// SIGTERM on unix. `Child::id` is `None` once the child has been reaped.
#[cfg(unix)]
fn send_terminate(child: &mut Child) -> Result<(), ProcessError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = child.id().ok_or(ProcessError::ProcessExited)?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| ProcessError::SignalFailed(e.to_string()))
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> Result<(), ProcessError> {
    child
        .start_kill()
        .map_err(|e| ProcessError::SignalFailed(e.to_string()))
}

/// Own the child until it is reaped, delivering stop signals on request.
async fn reap(
    mut child: Child,
    mut signals: mpsc::Receiver<StopSignal>,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => {
                if signal == StopSignal::Terminate {
                    match send_terminate(&mut child) {
                        Ok(()) => continue,
                        Err(e) => warn!("Failed to signal encoder: {}; forcing kill", e),
                    }
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill encoder: {}", e);
                }
                break child.wait().await;
            }
        }
    };
    // Refuse further signals before anyone can observe the exit
    drop(signals);

    let exit = match status {
        Ok(status) => ProcessExit::from_status(status),
        Err(e) => {
            warn!("Failed to wait for encoder: {}", e);
            ProcessExit::default()
        }
    };
    let _ = exit_tx.send(exit);
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, command: &EncoderCommand) -> Result<LaunchedProcess, ProcessError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{}: {}", command.program, e)))?;

        let pid = child.id();
        info!(pid = ?pid, program = %command.program, "Encoder process started");

        let (line_tx, line_rx) = mpsc::channel(256);
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut splitter = LineSplitter::new();
                let mut buffer = vec![0u8; 4096];
                loop {
                    match stderr.read(&mut buffer).await {
                        Ok(0) => break,
                        Ok(n) => {
                            for line in splitter.push(&buffer[..n]) {
                                if line_tx.send(line).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Error reading encoder output: {}", e);
                            break;
                        }
                    }
                }
                if let Some(line) = splitter.finish() {
                    let _ = line_tx.send(line).await;
                }
                debug!("Encoder output reader exiting");
            });
        }

        let (signal_tx, signal_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(reap(child, signal_rx, exit_tx));

        Ok(LaunchedProcess {
            pid,
            output: line_rx,
            exit: exit_rx,
            control: Box::new(TokioControl { signal_tx }),
        })
    }
}
