//! External utility execution
//!
//! This module is the ONLY sanctioned way to run partitioning, ZFS,
//! bootstrap and bootloader utilities. Components never build a
//! `std::process::Command` themselves; they describe an [`Invocation`] and
//! hand it to a [`CommandRunner`].
//!
//! # Guarantees of [`SystemRunner`]
//!
//! - Each utility runs in its own process group (see
//!   [`CommandProcessGroup`]), so terminal signals reach the installer only
//! - Secrets are written to stdin, never placed in argv or logs
//! - Every invocation has a bounded timeout. A timed-out utility is reported
//!   as [`CommandFailure::TimedOut`] and left running; it is not killed
//! - Output is captured with `LC_ALL=C` so diagnostics can be classified

use crate::error::CommandFailure;
use crate::process_guard::CommandProcessGroup;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Budget applied when an invocation does not set its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A single external utility call.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Run `program` inside the installed tree via `arch-chroot`.
    pub fn chroot(target: &Path, program: impl Into<String>) -> Self {
        Self::new("arch-chroot")
            .arg(target.display().to_string())
            .arg(program)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `secret` to the utility's stdin.
    ///
    /// The content never appears in [`Invocation::command_line`] or `Debug`.
    pub fn stdin_secret(mut self, secret: impl Into<String>) -> Self {
        self.stdin = Some(secret.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn timeout_budget(&self) -> Duration {
        self.timeout
    }

    /// Space-joined program and arguments, safe to log.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.command_line())
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Output from a finished utility.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Map a non-zero exit to [`CommandFailure::Exit`].
    pub fn ensure_success(self, command: &str) -> Result<Self, CommandFailure> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandFailure::Exit {
                command: command.to_string(),
                code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Executes external utilities on behalf of the installer components.
///
/// The workflow owns one runner and passes it down by reference. Tests
/// substitute a scripted implementation so no real disk is touched.
pub trait CommandRunner {
    /// Run to completion and return whatever the utility produced.
    ///
    /// Fails only when the utility could not be run or did not finish in
    /// time; a non-zero exit is still `Ok`.
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure>;

    /// Run and require a zero exit status.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
        self.execute(invocation)?
            .ensure_success(&invocation.command_line())
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
        (**self).execute(invocation)
    }
}

/// Runs utilities on the live system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
        let command_line = invocation.command_line();
        info!("exec: {}", command_line);

        let mut cmd = Command::new(invocation.program());
        cmd.args(invocation.arguments())
            .env("LC_ALL", "C")
            .stdin(if invocation.stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let mut child = cmd.spawn().map_err(|source| CommandFailure::Spawn {
            command: command_line.clone(),
            source,
        })?;
        debug!("spawned pid {} for `{}`", child.id(), command_line);

        // Drain output before feeding stdin so an early exit still leaves its stderr
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        if let (Some(secret), Some(mut stdin)) = (invocation.stdin(), child.stdin.take()) {
            match stdin.write_all(secret.as_bytes()) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    debug!("`{}` closed stdin before reading all input", command_line);
                }
                Err(source) => {
                    return Err(CommandFailure::Io {
                        command: command_line,
                        source,
                    });
                }
            }
            // Dropping stdin closes the pipe so the utility sees EOF
        }

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= invocation.timeout_budget() => {
                    warn!(
                        "`{}` exceeded its {}s budget; leaving pid {} running",
                        command_line,
                        invocation.timeout_budget().as_secs(),
                        child.id()
                    );
                    return Err(CommandFailure::TimedOut {
                        command: command_line,
                        timeout: invocation.timeout_budget(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    return Err(CommandFailure::Io {
                        command: command_line,
                        source,
                    });
                }
            }
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        let exit_code = status.code();

        if status.success() {
            debug!("`{}` succeeded in {:?}", command_line, started.elapsed());
        } else {
            debug!(
                "`{}` failed with exit code {}",
                command_line,
                exit_code.unwrap_or(-1)
            );
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        // A read error only truncates diagnostics
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(reader: Option<thread::JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Last `lines` lines of `text`, for compact diagnostics.
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
