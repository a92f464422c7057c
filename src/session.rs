//! Session data and host facts
//!
//! A [`Session`] is built once, after the tunnel binary has been resolved,
//! and stays immutable until rollback discards it.

use crate::config::Config;
use crate::error::{Result, RwtError};
use crate::journal::remove_if_exists;
use crate::proxy::{ProcessTable, SystemProcesses};
use chrono::Local;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Release architecture of the tunnel binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Arm64,
    Arm32v7,
    X86,
}

impl Architecture {
    /// Map a machine token (`uname -m` style) to a release architecture
    pub fn from_machine(token: &str) -> Result<Self> {
        match token {
            "x86_64" | "amd64" => Ok(Architecture::X86_64),
            "aarch64" | "arm64" => Ok(Architecture::Arm64),
            "armv7l" | "armv7" | "arm" => Ok(Architecture::Arm32v7),
            "i686" | "i386" | "x86" => Ok(Architecture::X86),
            other => Err(RwtError::UnsupportedArchitecture(format!(
                "no tunnel binary is published for '{other}'"
            ))),
        }
    }

    /// Token used in release asset names
    pub fn release_token(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::Arm32v7 => "arm32v7",
            Architecture::X86 => "x86",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.release_token())
    }
}

/// Facts about the host the session runs on
#[derive(Debug, Clone)]
pub struct HostFacts {
    /// Effective user id
    pub euid: u32,
    /// Machine architecture token
    pub machine: String,
    /// Filesystem root that proxy surfaces are resolved against
    pub root: PathBuf,
    /// Process list used for desktop session discovery
    pub processes: Arc<dyn ProcessTable>,
}

impl HostFacts {
    /// Facts of the running host
    pub fn detect() -> Self {
        Self {
            euid: effective_uid(),
            machine: machine(),
            root: PathBuf::from("/"),
            processes: Arc::new(SystemProcesses),
        }
    }

    pub fn check_privileges(&self) -> Result<()> {
        if self.euid != 0 {
            return Err(RwtError::Privilege(
                "This program requires root privileges to manage the tunnel device and routes. Please run with sudo.".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve an absolute host path under [`HostFacts::root`]
    pub fn path(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }
}

#[cfg(unix)]
fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
fn effective_uid() -> u32 {
    u32::MAX
}

/// Machine token of the running kernel, as `uname -m` prints it
#[cfg(unix)]
fn machine() -> String {
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        log::warn!("uname failed: {}", std::io::Error::last_os_error());
        return std::env::consts::ARCH.to_string();
    }
    let machine = unsafe { std::ffi::CStr::from_ptr(name.machine.as_ptr()) };
    machine.to_string_lossy().into_owned()
}

#[cfg(not(unix))]
fn machine() -> String {
    std::env::consts::ARCH.to_string()
}

/// Immutable parameters of one tunnel session
#[derive(Debug, Clone)]
pub struct Session {
    pub architecture: Architecture,
    pub workspace: PathBuf,
    pub log_file: PathBuf,
    pub config_file: PathBuf,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_scheme: String,
    pub asset_name: String,
    pub binary_path: PathBuf,
    pub desktop_user: Option<String>,
}

impl Session {
    pub fn new(
        config: &Config,
        architecture: Architecture,
        asset_name: String,
        binary_path: PathBuf,
    ) -> Self {
        let workspace = config.session.workspace.clone();
        let stamp = Local::now().format("%Y%m%d_%H%M%S");

        Self {
            architecture,
            log_file: workspace.join("logs").join(format!("pdanet_{stamp}.log")),
            config_file: workspace.join("hev-socks5-tunnel.yml"),
            workspace,
            proxy_host: config.proxy.host.clone(),
            proxy_port: config.proxy.port,
            proxy_scheme: config.proxy.scheme.clone(),
            asset_name,
            binary_path,
            desktop_user: config.session.desktop_user.clone(),
        }
    }

    /// Proxy URL written into every proxy directive
    pub fn proxy_url(&self) -> String {
        format!("{}://{}:{}", self.proxy_scheme, self.proxy_host, self.proxy_port)
    }
}

/// PID file that keeps a second session from starting
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Take the lock, replacing it if the recorded PID is gone
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if pid_alive(pid) => {
                            return Err(RwtError::SessionActive(format!(
                                "pid {pid} holds {}",
                                path.display()
                            )));
                        }
                        _ => {
                            log::warn!("Removing stale session lock {}", path.display());
                            remove_if_exists(path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RwtError::SessionActive(format!(
            "could not take {}",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = remove_if_exists(&self.path);
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM still means the pid is live.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}
