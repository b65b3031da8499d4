use std::ffi::OsString;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use msicore::error::{MsiError, Result};

/// Shared flag that asks running engine tasks to stop.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How an external engine run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// The process exited unsuccessfully; `None` if it was terminated by a signal.
    NonZeroExit(Option<i32>),
    TimedOut,
    Cancelled,
    SpawnFailed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }

    /// Map every outcome but `Success` to `MsiError::Subprocess`.
    pub fn into_result(self, tool: &str) -> Result<()> {
        match self {
            TaskOutcome::Success => Ok(()),
            outcome => Err(MsiError::Subprocess {
                tool: tool.to_string(),
                outcome: outcome.to_string(),
            }),
        }
    }
}

impl Display for TaskOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Success => write!(f, "success"),
            TaskOutcome::NonZeroExit(Some(code)) => write!(f, "exit code {}", code),
            TaskOutcome::NonZeroExit(None) => write!(f, "terminated by signal"),
            TaskOutcome::TimedOut => write!(f, "timed out"),
            TaskOutcome::Cancelled => write!(f, "cancelled"),
            TaskOutcome::SpawnFailed(msg) => write!(f, "could not be started: {}", msg),
        }
    }
}

/// One invocation of an external engine.
///
/// Standard output is discarded, only the exit status and the files the engine writes
/// matter. The run is bounded by an optional timeout and can be cancelled through a
/// [`CancellationToken`]; in both cases the process is killed.
#[derive(Clone, Debug)]
pub struct ExternalTask {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    poll_interval: Duration,
}

impl ExternalTask {
    pub fn new(program: &Path) -> Self {
        ExternalTask {
            program: program.to_path_buf(),
            args: Vec::new(),
            timeout: None,
            cancellation: None,
            poll_interval: Duration::from_millis(20),
        }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a flag followed by a path, e.g. `-f fixed.nrrd`.
    pub fn flag(self, flag: &str, value: &Path) -> Self {
        self.arg(flag).arg(value.as_os_str())
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Launch the process and block until it ends, times out or is cancelled.
    pub fn run(&self) -> TaskOutcome {
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return TaskOutcome::SpawnFailed(format!("{}: {}", self.program.display(), e)),
        };

        info!("Start {} ...", self.program.display());
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("{} complete ({})", self.program.display(), status);
                    return if status.success() {
                        TaskOutcome::Success
                    } else {
                        TaskOutcome::NonZeroExit(status.code())
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    terminate(&mut child);
                    return TaskOutcome::SpawnFailed(format!("waiting for {} failed: {}", self.program.display(), e));
                }
            }

            if self.cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
                warn!("{} cancelled", self.program.display());
                terminate(&mut child);
                return TaskOutcome::Cancelled;
            }
            if self.timeout.is_some_and(|t| started.elapsed() >= t) {
                warn!("{} timed out after {:?}", self.program.display(), started.elapsed());
                terminate(&mut child);
                return TaskOutcome::TimedOut;
            }
            thread::sleep(self.poll_interval);
        }
    }
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Killing engine process failed: {}", e);
    }
    let _ = child.wait();
}
