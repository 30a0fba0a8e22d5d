//! Deadline-bounded execution of external CLIs (issue tracker, vcs).
//!
//! A deadline that expires is reported as [`RatchetError::Timeout`], never as
//! a command failure, so callers can tell "couldn't tell in time" apart from
//! "tool missing" or "nothing matched".

use crate::core::error::RatchetError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Expiry instant plus an optional cancel flag shared with the caller.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Runs `spec` to completion unless `deadline` expires or is cancelled first,
/// in which case the child is killed.
pub fn run_with_deadline(
    spec: &CommandSpec,
    deadline: &Deadline,
) -> Result<CommandOutput, RatchetError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| RatchetError::CommandFailed {
        command: spec.display(),
        detail: e.to_string(),
    })?;

    let (tx, rx) = mpsc::channel();
    let pending = drain(child.stdout.take(), Stream::Stdout, &tx)
        + drain(child.stderr.take(), Stream::Stderr, &tx);
    drop(tx);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill(&mut child);
                return Err(RatchetError::CommandFailed {
                    command: spec.display(),
                    detail: e.to_string(),
                });
            }
        }
        if let Some(err) = interrupted(spec, deadline) {
            kill(&mut child);
            return Err(err);
        }
        thread::sleep(POLL_INTERVAL);
    };

    // A background grandchild can hold the pipes open after the child exits.
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut remaining = pending;
    while remaining > 0 {
        if let Some(err) = interrupted(spec, deadline) {
            return Err(err);
        }
        match rx.recv_timeout(deadline.remaining().min(POLL_INTERVAL)) {
            Ok((Stream::Stdout, bytes)) => stdout = bytes,
            Ok((Stream::Stderr, bytes)) => stderr = bytes,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
        remaining -= 1;
    }

    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Cancellation wins over expiry when both hold.
fn interrupted(spec: &CommandSpec, deadline: &Deadline) -> Option<RatchetError> {
    if deadline.cancelled() {
        return Some(RatchetError::Cancelled {
            command: spec.display(),
        });
    }
    if deadline.expired() {
        tracing::warn!(command = %spec.display(), timeout = ?deadline.timeout(), "subprocess deadline exceeded");
        return Some(RatchetError::Timeout {
            command: spec.display(),
            after: deadline.timeout(),
        });
    }
    None
}

enum Stream {
    Stdout,
    Stderr,
}

/// Reads `pipe` to EOF on its own thread and sends the bytes on `tx`.
/// Returns the number of readers started.
fn drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    stream: Stream,
    tx: &Sender<(Stream, Vec<u8>)>,
) -> usize {
    let Some(mut reader) = pipe else {
        return 0;
    };
    let tx = tx.clone();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
    1
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
