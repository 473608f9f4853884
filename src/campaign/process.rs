//! External command execution with a wall-clock timeout.

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Process execution errors. A timeout is an outcome, not an error.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Command could not be started.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stdout or stderr reader thread panicked.
    #[error("output capture for `{0}` failed")]
    Capture(String),
}

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run, resolved through `PATH` when relative.
    pub program: OsString,
    /// Arguments passed verbatim.
    pub args: Vec<OsString>,
    /// Working directory, inherited when `None`.
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Command with no arguments.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    /// Build from an argv vector; `None` when it is empty.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next()?;
        Some(Self {
            program,
            args: argv.collect(),
            current_dir: None,
        })
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `dir`.
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Exit code; a signal death is reported as `128 + signal`.
    pub exit_code: i32,
    /// Full stdout.
    pub stdout: Vec<u8>,
    /// Full stderr.
    pub stderr: Vec<u8>,
    /// Wall-clock time until exit.
    pub elapsed: Duration,
}

impl ExecutionRecord {
    /// True if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of one bounded process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Process exited before the deadline.
    Completed(ExecutionRecord),
    /// Deadline passed; the process group was terminated.
    TimedOut,
}

impl ProcessOutcome {
    /// Completed record, if any.
    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            Self::Completed(record) => Some(record),
            Self::TimedOut => None,
        }
    }

    /// True for [`ProcessOutcome::TimedOut`].
    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Runs commands one at a time, each in its own process group.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    poll_interval: Duration,
    kill_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessRunner {
    /// Runner with the default polling cadence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time a terminated group gets to exit before it is killed outright.
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Run `spec` with `env` layered on the inherited environment.
    ///
    /// `timeout` bounds both the leader's exit and the draining of its
    /// output pipes, so a descendant that keeps stdout or stderr open counts
    /// as a timeout. On timeout the whole process group receives `SIGTERM`,
    /// then `SIGKILL` once the grace period ends; output captured so far is
    /// discarded.
    pub fn run<K, V>(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        env: &[(K, V)],
    ) -> Result<ProcessOutcome, ProcessError>
    where
        K: AsRef<std::ffi::OsStr>,
        V: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.to_string_lossy().into_owned(),
            source,
        })?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = started + timeout;
        let mut exited = None;
        let status = loop {
            if exited.is_none() {
                exited = child.try_wait()?;
            }
            if let Some(status) = exited {
                if drained(&stdout) && drained(&stderr) {
                    break status;
                }
            }
            if Instant::now() >= deadline {
                debug!(
                    command = %spec.display(),
                    ?timeout,
                    leader_exited = exited.is_some(),
                    "process timed out"
                );
                self.terminate_group(&mut child, exited.is_some());
                // Readers finish once the killed group releases the pipes.
                return Ok(ProcessOutcome::TimedOut);
            }
            thread::sleep(self.poll_interval);
        };
        let elapsed = started.elapsed();

        Ok(ProcessOutcome::Completed(ExecutionRecord {
            exit_code: exit_code(status),
            stdout: collect(stdout, spec)?,
            stderr: collect(stderr, spec)?,
            elapsed,
        }))
    }

    /// `SIGTERM` the group, wait out the grace period, then `SIGKILL` it.
    fn terminate_group(&self, child: &mut Child, mut reaped: bool) {
        signal_group(child, Signal::Terminate);
        let grace_deadline = Instant::now() + self.kill_grace;
        while Instant::now() < grace_deadline {
            if !reaped {
                match child.try_wait() {
                    Ok(Some(_)) => reaped = true,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "failed to poll terminated process");
                        break;
                    }
                }
            }
            if reaped && !group_alive(child) {
                break;
            }
            thread::sleep(self.poll_interval);
        }
        signal_group(child, Signal::Kill);
        if !reaped {
            if let Err(err) = child.wait() {
                warn!(error = %err, "failed to reap killed process");
            }
        }
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: Signal) {
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: `killpg` has no memory-safety preconditions; the child was
    // spawned with `process_group(0)` so its pid is its group id, and the
    // id stays reserved while any member of the group is alive.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH) {
        let _ = child.kill();
    }
}

/// True while any process remains in the child's group.
#[cfg(unix)]
fn group_alive(child: &Child) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the group exists.
    unsafe { libc::killpg(pgid, 0) == 0 }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: Signal) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn group_alive(_child: &Child) -> bool {
    false
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn drained(handle: &Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> bool {
    handle.as_ref().is_none_or(JoinHandle::is_finished)
}

fn collect(
    handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    spec: &CommandSpec,
) -> Result<Vec<u8>, ProcessError> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| ProcessError::Capture(spec.display()))?
            .map_err(ProcessError::Io),
        None => Ok(Vec::new()),
    }
}
