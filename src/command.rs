//! External command execution
//!
//! Every host mutation that goes through a system tool (`ip`, `sysctl`,
//! `systemctl`, `git`) is issued through [`CommandRunner`], so the whole
//! session can be exercised against a simulated host.

use crate::error::{IntoRwtError, Result, RwtError};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// A command line plus an optional time bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Seam for running host programs
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. `Err` means the command could not be
    /// run at all or timed out; a non-zero exit is reported through
    /// [`CommandOutput::success`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Whether `program` is found on `PATH`
    fn which(&self, program: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
            })
            .unwrap_or(false)
    }

    /// Run and turn a non-zero exit into an error
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec)?;
        if output.success {
            Ok(output)
        } else {
            Err(RwtError::Command(format!(
                "`{spec}` failed: {}",
                output.stderr.trim()
            )))
        }
    }
}

/// Retry a command up to `attempts` times, returning the first success
pub fn run_with_retry(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    attempts: u32,
) -> Result<CommandOutput> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match runner.run_checked(spec) {
            Ok(output) => return Ok(output),
            Err(e) => {
                log::debug!("Attempt {attempt}/{attempts} of `{spec}` failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| RwtError::Command(format!("`{spec}` never ran"))))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs commands on the real host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        log::debug!("Running `{spec}`");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .into_rwt_error(&format!("Failed to start `{spec}`"))?;

        let status = match spec.timeout {
            None => child.wait()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(RwtError::Command(format!(
                            "`{spec}` timed out after {timeout:?}"
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        };

        // Output of the tools we drive is small enough to sit in the pipe
        // buffer until exit.
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout);
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }

        Ok(CommandOutput {
            success: status.success(),
            stdout,
            stderr,
        })
    }
}
