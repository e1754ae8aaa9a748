// src/kitchen/process.rs

//! Child process execution with captured output, deadline and cancellation
//!
//! Every external program a recipe runs goes through [`run_process`]:
//! - stdin is nulled so a prompt can never hang a build
//! - stdout and stderr are drained on reader threads and kept verbatim
//! - the child runs in its own process group so a timeout or cancellation
//!   kills `make` together with everything it spawned

use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often a waiting runner re-checks cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to keep reading after the process group was killed
const READER_GRACE: Duration = Duration::from_millis(500);

/// Shared flag used to cancel in-flight work
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Output captured from a child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    pub(crate) fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.stdout.is_empty() {
            writeln!(f, "--- stdout ---")?;
            f.write_str(&self.stdout)?;
            if !self.stdout.ends_with('\n') {
                writeln!(f)?;
            }
        }
        if !self.stderr.is_empty() {
            writeln!(f, "--- stderr ---")?;
            f.write_str(&self.stderr)?;
            if !self.stderr.ends_with('\n') {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own; `code` is `None` when killed by a signal
    Exited { code: Option<i32>, success: bool },
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessResult {
    pub outcome: ProcessOutcome,
    pub output: CapturedOutput,
    pub duration: Duration,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        matches!(self.outcome, ProcessOutcome::Exited { success: true, .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ProcessOutcome::Exited { code, .. } => code,
            _ => None,
        }
    }
}

/// Which pipe a reader thread drained
#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>, stream: Stream, tx: Sender<(Stream, Vec<u8>)>) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            // A read error only truncates the capture
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send((stream, buf));
    });
}

/// Time left before `deadline`, capped at the poll interval
fn next_wait(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| (deadline - now).min(POLL_INTERVAL))
        }
        None => Some(POLL_INTERVAL),
    }
}

/// Wait for both reader threads
///
/// The leader exiting does not close the pipes: anything it left running in
/// the background still holds them. Waiting for them stays bounded by the
/// deadline and the cancel token; when either trips, the process group is
/// killed and the step counts as timed out or cancelled.
fn collect_output(
    rx: &Receiver<(Stream, Vec<u8>)>,
    child: &mut Child,
    mut outcome: ProcessOutcome,
    deadline: Option<Instant>,
    cancel: &CancelToken,
) -> (ProcessOutcome, CapturedOutput) {
    let mut stdout = None;
    let mut stderr = None;
    // Already killed: only collect what is left in the pipes
    let mut grace = (!matches!(outcome, ProcessOutcome::Exited { .. }))
        .then(|| Instant::now() + READER_GRACE);

    while stdout.is_none() || stderr.is_none() {
        let wait_for = match grace {
            Some(until) => match until.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => left,
                _ => break,
            },
            None if cancel.is_cancelled() => {
                kill_group(child);
                outcome = ProcessOutcome::Cancelled;
                grace = Some(Instant::now() + READER_GRACE);
                continue;
            }
            None => match next_wait(deadline) {
                Some(wait_for) => wait_for,
                None => {
                    kill_group(child);
                    outcome = ProcessOutcome::TimedOut;
                    grace = Some(Instant::now() + READER_GRACE);
                    continue;
                }
            },
        };

        match rx.recv_timeout(wait_for) {
            Ok((Stream::Stdout, buf)) => stdout = Some(buf),
            Ok((Stream::Stderr, buf)) => stderr = Some(buf),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let text = |buf: Option<Vec<u8>>| String::from_utf8_lossy(&buf.unwrap_or_default()).into_owned();
    (
        outcome,
        CapturedOutput {
            stdout: text(stdout),
            stderr: text(stderr),
        },
    )
}

fn kill_group(child: &mut Child) {
    // The child leads its own process group (see `process_group(0)`)
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) with a negative pid signals a process group; no memory is touched.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

/// Run a prepared command to completion
///
/// `deadline` bounds the wall-clock time; `label` prefixes logged output.
pub fn run_process(
    cmd: &mut Command,
    deadline: Option<Instant>,
    cancel: &CancelToken,
    label: &str,
) -> io::Result<ProcessResult> {
    let started = Instant::now();

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let (tx, rx) = mpsc::channel();
    drain(child.stdout.take(), Stream::Stdout, tx.clone());
    drain(child.stderr.take(), Stream::Stderr, tx);

    let outcome = loop {
        if cancel.is_cancelled() {
            kill_group(&mut child);
            let _ = child.wait();
            break ProcessOutcome::Cancelled;
        }

        let Some(wait_for) = next_wait(deadline) else {
            kill_group(&mut child);
            let _ = child.wait();
            break ProcessOutcome::TimedOut;
        };

        if let Some(status) = child.wait_timeout(wait_for)? {
            break ProcessOutcome::Exited {
                code: status.code(),
                success: status.success(),
            };
        }
    };

    let (outcome, output) = collect_output(&rx, &mut child, outcome, deadline, cancel);

    for line in output.stdout.lines() {
        debug!("[{}] {}", label, line);
    }
    for line in output.stderr.lines() {
        debug!("[{}] {}", label, line);
    }
    match outcome {
        ProcessOutcome::TimedOut => warn!("[{}] timed out, process group killed", label),
        ProcessOutcome::Cancelled => warn!("[{}] cancelled, process group killed", label),
        ProcessOutcome::Exited { .. } => {}
    }

    Ok(ProcessResult {
        outcome,
        output,
        duration: started.elapsed(),
    })
}
