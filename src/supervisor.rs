//! Tunnel process supervision
//!
//! The tunnel binary runs as its own process group so terminal signals
//! reach only the controller, which then stops the child through the
//! handle it got at spawn time.

use crate::error::{Result, RwtError};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::Instant;

/// A running tunnel binary
#[derive(Debug)]
pub struct TunnelProcess {
    child: Child,
    pid: u32,
    binary: PathBuf,
    stopped: bool,
}

impl TunnelProcess {
    /// Start `binary` with `config_file` as its only argument
    pub fn spawn(binary: &Path, config_file: &Path) -> Result<Self> {
        if !binary.is_file() {
            return Err(RwtError::ProcessSupervision(format!(
                "tunnel binary {} not found",
                binary.display()
            )));
        }

        let mut command = Command::new(binary);
        command
            .arg(config_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            RwtError::ProcessSupervision(format!("failed to start {}: {e}", binary.display()))
        })?;
        let pid = child.id();
        log::info!("Started {} (pid {pid})", binary.display());

        Ok(Self {
            child,
            pid,
            binary: binary.to_path_buf(),
            stopped: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        !self.stopped && matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait until the binary has opened its log file.
    ///
    /// Fails with `ProcessSupervision` if the process exits first and with
    /// `StartupTimeout` if the log never appears within `timeout`.
    pub async fn wait_ready(&mut self, log_file: &Path, timeout: Duration, poll: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(RwtError::ProcessSupervision(format!(
                    "{} exited during startup ({status})",
                    self.binary.display()
                )));
            }

            if log_file.exists() {
                log::info!("Tunnel process {} is up", self.pid);
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(RwtError::StartupTimeout(format!(
                    "no log at {} after {timeout:?}",
                    log_file.display()
                )));
            }

            tokio::time::sleep(poll).await;
        }
    }

    /// Kill the process and reap it. Safe to call more than once and after
    /// the process has already exited.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        if let Some(status) = self.child.try_wait()? {
            log::info!("Tunnel process {} already exited ({status})", self.pid);
            return Ok(());
        }

        log::info!("Stopping tunnel process {}", self.pid);
        match self.child.kill() {
            Ok(()) => {}
            // Exited between try_wait and kill
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => {
                return Err(RwtError::ProcessSupervision(format!(
                    "failed to kill pid {}: {e}",
                    self.pid
                )))
            }
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
