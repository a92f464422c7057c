//! System proxy propagation
//!
//! Tools that do not route through the tunnel device still need to reach
//! the network through the phone's proxy. Each such surface is a
//! [`ProxyTarget`] with an explicit absent/present state and its own
//! journal, so it can be reverted on its own or together with the rest.
//!
//! Propagation is best-effort: a target that fails is logged and the next
//! one is still attempted.

pub mod desktop;
pub mod edit;
mod packages;
mod services;
mod tools;
mod user;

pub use desktop::{DesktopUser, ProcessTable, SystemProcesses};
pub use packages::{AptTarget, MacPortsTarget, NixosTarget, PacmanTarget};
pub use services::DockerTarget;
pub use tools::{CurlTarget, EnvironmentTarget, GitTarget, PROXY_ENV_VARS};
pub use user::{KdeTarget, NpmTarget};

use crate::command::CommandRunner;
use crate::config::Config;
use crate::error::{Result, RwtError};
use crate::journal::{read_optional, Journal};
use crate::session::{HostFacts, Session};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Every proxy surface the propagator knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Apt,
    Pacman,
    Nixos,
    Macports,
    Kde,
    Docker,
    Curl,
    Git,
    Npm,
    Environment,
}

impl TargetKind {
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Apt => "apt",
            TargetKind::Pacman => "pacman",
            TargetKind::Nixos => "nixos",
            TargetKind::Macports => "macports",
            TargetKind::Kde => "kde",
            TargetKind::Docker => "docker",
            TargetKind::Curl => "curl",
            TargetKind::Git => "git",
            TargetKind::Npm => "npm",
            TargetKind::Environment => "environment",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a target's directive is currently in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Absent,
    Present,
}

/// The proxy every directive points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything a target needs to detect and apply itself
pub struct ProxyContext {
    /// Filesystem root that absolute surface paths are resolved against
    pub root: PathBuf,
    pub runner: Arc<dyn CommandRunner>,
    pub endpoint: ProxyEndpoint,
    pub desktop_user: Option<DesktopUser>,
    /// A KDE session process is running
    pub kde_session: bool,
    pub service_timeout: Duration,
    pub service_attempts: u32,
}

impl ProxyContext {
    pub fn new(host: &HostFacts, session: &Session, config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let processes = host.processes.processes();
        let kde_session = desktop::kde_session_uid(&processes).is_some();
        let desktop_user = desktop::discover(&host.root, &processes, session.desktop_user.as_deref());

        Self {
            root: host.root.clone(),
            runner,
            endpoint: ProxyEndpoint {
                scheme: session.proxy_scheme.clone(),
                host: session.proxy_host.clone(),
                port: session.proxy_port,
            },
            desktop_user,
            kde_session,
            service_timeout: config.service_timeout(),
            service_attempts: config.session.service_attempts,
        }
    }

    /// Resolve an absolute host path under [`ProxyContext::root`]
    pub fn path(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }

    /// A path inside the desktop user's home
    pub fn user_path(&self, user: &DesktopUser, relative: &str) -> PathBuf {
        self.root
            .join(user.home.strip_prefix("/").unwrap_or(&user.home))
            .join(relative)
    }
}

/// Outcome of [`edit_file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Unchanged,
    Updated,
    Created,
}

/// Rewrite `path` through `edit`, journaling the prior content. A file that
/// already holds the edited text is left alone and not journaled.
pub fn edit_file(
    journal: &mut Journal,
    label: &str,
    path: &Path,
    edit: impl FnOnce(&str) -> String,
) -> Result<FileChange> {
    let prior = read_optional(path)?;
    let current = prior
        .as_deref()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default();
    let updated = edit(&current);

    if prior.is_some() && updated == current {
        return Ok(FileChange::Unchanged);
    }

    journal.write_file(label, path, updated.as_bytes())?;
    log::debug!("{label}: wrote {}", path.display());
    Ok(if prior.is_some() {
        FileChange::Updated
    } else {
        FileChange::Created
    })
}

/// One proxy surface
pub trait ProxyTarget: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Whether the surface exists on this host
    fn detect(&self, ctx: &ProxyContext) -> bool;

    /// Put the directive in place, journaling every mutation. Must be
    /// idempotent: a second apply leaves the surface as a single one does.
    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()>;
}

/// Every built-in target, in application order
pub fn default_targets() -> Vec<Box<dyn ProxyTarget>> {
    vec![
        Box::new(AptTarget),
        Box::new(PacmanTarget),
        Box::new(NixosTarget),
        Box::new(MacPortsTarget),
        Box::new(KdeTarget),
        Box::new(DockerTarget),
        Box::new(CurlTarget),
        Box::new(GitTarget),
        Box::new(NpmTarget),
        Box::new(EnvironmentTarget),
    ]
}

struct Slot {
    target: Box<dyn ProxyTarget>,
    state: TargetState,
    journal: Journal,
}

/// Applies and reverts proxy directives across all targets
pub struct ProxyPropagator {
    ctx: ProxyContext,
    slots: Vec<Slot>,
    /// Order in which targets became present
    applied_order: Vec<TargetKind>,
}

impl ProxyPropagator {
    /// Built-in targets minus the disabled ones
    pub fn new(ctx: ProxyContext, disabled: &[TargetKind]) -> Self {
        let targets = default_targets()
            .into_iter()
            .filter(|t| !disabled.contains(&t.kind()))
            .collect();
        Self::with_targets(ctx, targets)
    }

    pub fn with_targets(ctx: ProxyContext, targets: Vec<Box<dyn ProxyTarget>>) -> Self {
        let slots = targets
            .into_iter()
            .map(|target| Slot {
                target,
                state: TargetState::Absent,
                journal: Journal::new(),
            })
            .collect();

        Self {
            ctx,
            slots,
            applied_order: Vec::new(),
        }
    }

    pub fn state(&self, kind: TargetKind) -> TargetState {
        self.slots
            .iter()
            .find(|s| s.target.kind() == kind)
            .map(|s| s.state)
            .unwrap_or(TargetState::Absent)
    }

    /// Targets whose directives are in place, oldest first
    pub fn applied(&self) -> &[TargetKind] {
        &self.applied_order
    }

    /// Apply one target. `Ok(false)` when it is not detected on this host.
    pub fn apply(&mut self, kind: TargetKind) -> Result<bool> {
        let Some(index) = self.slots.iter().position(|s| s.target.kind() == kind) else {
            return Ok(false);
        };
        let slot = &mut self.slots[index];

        if !slot.target.detect(&self.ctx) {
            log::debug!("Proxy target {kind} not detected");
            return Ok(false);
        }

        let result = slot.target.apply(&self.ctx, &mut slot.journal);

        // A partial apply still leaves mutations that revert has to undo
        if !slot.journal.is_empty() && slot.state == TargetState::Absent {
            slot.state = TargetState::Present;
            self.applied_order.push(kind);
        }

        result
            .map(|()| true)
            .map_err(|e| RwtError::ProxyPropagation(format!("{kind}: {e}")))
    }

    /// Apply every detected target, logging failures. Returns the targets
    /// that applied cleanly.
    pub fn apply_all(&mut self) -> Vec<TargetKind> {
        let kinds: Vec<TargetKind> = self.slots.iter().map(|s| s.target.kind()).collect();
        let mut applied = Vec::new();

        for kind in kinds {
            match self.apply(kind) {
                Ok(true) => {
                    log::info!("Proxy set for {kind}");
                    applied.push(kind);
                }
                Ok(false) => {}
                Err(e) => log::warn!("{e}"),
            }
        }
        applied
    }

    /// Undo one target. Reverting a target that was never applied is a
    /// no-op.
    pub fn revert(&mut self, kind: TargetKind) -> Vec<RwtError> {
        let Some(slot) = self.slots.iter_mut().find(|s| s.target.kind() == kind) else {
            return Vec::new();
        };
        if slot.state == TargetState::Absent {
            return Vec::new();
        }

        let failures = slot.journal.rollback(self.ctx.runner.as_ref());
        slot.state = TargetState::Absent;
        self.applied_order.retain(|k| *k != kind);
        log::info!("Proxy reverted for {kind}");
        failures
    }

    /// Undo every applied target, newest first
    pub fn revert_all(&mut self) -> Vec<RwtError> {
        let order: Vec<TargetKind> = self.applied_order.iter().rev().copied().collect();
        order.into_iter().flat_map(|kind| self.revert(kind)).collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::command::testing::RecordingRunner;

    pub fn endpoint() -> ProxyEndpoint {
        ProxyEndpoint {
            scheme: "http".to_string(),
            host: "192.168.49.1".to_string(),
            port: 8000,
        }
    }

    pub fn context(root: &Path, runner: Arc<dyn CommandRunner>) -> ProxyContext {
        ProxyContext {
            root: root.to_path_buf(),
            runner,
            endpoint: endpoint(),
            desktop_user: None,
            kde_session: false,
            service_timeout: Duration::from_secs(5),
            service_attempts: 2,
        }
    }

    pub fn recording() -> Arc<RecordingRunner> {
        Arc::new(RecordingRunner::new())
    }
}
