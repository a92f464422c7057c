//! Session lifecycle
//!
//! Drives one tunnel session from start to a clean exit:
//!
//! ```text
//! INIT -> RESOLVING -> CONFIGURING -> RUNNING -> TERMINATING -> CLEANED
//!              \-> FAILED (nothing changed yet)
//! ```
//!
//! Everything that changes the host is journaled by the component that
//! made the change. Rollback asks each component to undo its own journal,
//! newest component first, and runs at most once per session.

use crate::command::CommandRunner;
use crate::config::Config;
use crate::emitter::{self, TunnelDocument};
use crate::error::{Result, RwtError};
use crate::journal::{Journal, RollbackGuard};
use crate::logfilter::LogFollower;
use crate::network::NetworkConfigurator;
use crate::proxy::{ProxyContext, ProxyPropagator};
use crate::resolver::ArtifactResolver;
use crate::session::{Architecture, HostFacts, Session, SessionLock};
use crate::signals::TerminationTrigger;
use crate::supervisor::TunnelProcess;
use chrono::Local;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// How often the tunnel process is checked while the log is followed
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Resolving,
    Configuring,
    Running,
    Terminating,
    Cleaned,
    Failed,
}

/// Timestamped progress line on stdout
pub fn status(message: impl std::fmt::Display) {
    println!("[{}] {message}", Local::now().format("%H:%M:%S"));
}

/// Why the running phase ended
enum Stop {
    Trigger(TerminationTrigger),
    Failure(RwtError),
}

pub struct LifecycleController {
    config: Config,
    host: HostFacts,
    runner: Arc<dyn CommandRunner>,
    guard: Arc<RollbackGuard>,
    state: LifecycleState,
    session: Option<Session>,
    lock: Option<SessionLock>,
    network: Option<NetworkConfigurator>,
    propagator: Option<ProxyPropagator>,
    /// Files the controller writes itself
    journal: Journal,
    process: Option<TunnelProcess>,
    tunnel_pid: Option<u32>,
}

impl LifecycleController {
    pub fn new(config: Config, host: HostFacts, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            host,
            runner,
            guard: Arc::new(RollbackGuard::new()),
            state: LifecycleState::Init,
            session: None,
            lock: None,
            network: None,
            propagator: None,
            journal: Journal::new(),
            process: None,
            tunnel_pid: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Pid of the tunnel process, once it has been started
    pub fn tunnel_pid(&self) -> Option<u32> {
        self.tunnel_pid
    }

    pub fn rollback_guard(&self) -> Arc<RollbackGuard> {
        self.guard.clone()
    }

    fn transition(&mut self, next: LifecycleState) {
        log::debug!("Lifecycle: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Abort before any mutation
    fn fail(&mut self, error: RwtError) -> i32 {
        eprintln!("Error: {error}");
        if error.is_fatal_before_mutation() {
            log::debug!("Host left untouched");
        }
        self.transition(LifecycleState::Failed);
        self.lock = None;
        EXIT_FAILURE
    }

    /// Run the whole session. `shutdown` resolves on the first termination
    /// trigger; it should be created before this is called so triggers
    /// that arrive during setup are not lost.
    pub async fn run<F>(&mut self, shutdown: F) -> i32
    where
        F: Future<Output = TerminationTrigger>,
    {
        tokio::pin!(shutdown);

        let arch = match self.preflight() {
            Ok(arch) => arch,
            Err(e) => return self.fail(e),
        };

        self.transition(LifecycleState::Resolving);
        let resolver = ArtifactResolver::new(&self.config);
        let artifact = tokio::select! {
            resolved = resolver.resolve(arch) => match resolved {
                Ok(artifact) => artifact,
                Err(e) => return self.fail(e),
            },
            trigger = &mut shutdown => {
                status(format!("{trigger} received before any change, exiting"));
                self.transition(LifecycleState::Cleaned);
                self.lock = None;
                return EXIT_SUCCESS;
            }
        };

        let session = Session::new(&self.config, arch, artifact.asset_name, artifact.path);
        status(format!("Using tunnel binary {}", session.binary_path.display()));
        self.session = Some(session.clone());

        self.transition(LifecycleState::Configuring);
        if let Err(e) = self.configure(&session).await {
            eprintln!("Error: {e}");
            self.rollback();
            self.transition(LifecycleState::Failed);
            return EXIT_FAILURE;
        }

        self.transition(LifecycleState::Running);
        let stop = self.follow(&session, &mut shutdown).await;

        self.transition(LifecycleState::Terminating);
        let code = match stop {
            Stop::Trigger(trigger) => {
                status(format!("{trigger} received, cleaning up"));
                EXIT_SUCCESS
            }
            Stop::Failure(e) => {
                eprintln!("Error: {e}");
                EXIT_FAILURE
            }
        };

        self.rollback();
        self.transition(LifecycleState::Cleaned);
        status("Cleanup complete");
        code
    }

    /// Privilege, architecture and the session lock
    fn preflight(&mut self) -> Result<Architecture> {
        self.host.check_privileges()?;
        let arch = Architecture::from_machine(&self.host.machine)?;
        log::info!("Host architecture {} ({arch})", self.host.machine);
        self.lock = Some(SessionLock::acquire(&self.config.session.lock_file)?);
        Ok(arch)
    }

    /// Interface, proxy targets, tunnel config and the tunnel process
    async fn configure(&mut self, session: &Session) -> Result<()> {
        let mut network = NetworkConfigurator::new(&self.config, self.runner.clone())?;
        network.configure();
        self.network = Some(network);

        let ctx = ProxyContext::new(&self.host, session, &self.config, self.runner.clone());
        let mut propagator = ProxyPropagator::new(ctx, &self.config.targets.disabled);
        let applied = propagator.apply_all();
        self.propagator = Some(propagator);
        status(format!(
            "Using proxy {} ({} target{} configured)",
            session.proxy_url(),
            applied.len(),
            if applied.len() == 1 { "" } else { "s" }
        ));

        let document = TunnelDocument::from_session(session, &self.config)?;
        emitter::emit(&document, &session.config_file, &mut self.journal)?;

        let process = self
            .process
            .insert(TunnelProcess::spawn(&session.binary_path, &session.config_file)?);
        self.tunnel_pid = Some(process.pid());
        status(format!("Tunnel process started (pid {})", process.pid()));

        process
            .wait_ready(
                &session.log_file,
                self.config.startup_timeout(),
                self.config.poll_interval(),
            )
            .await?;
        status(format!("Tunnel is up, logging to {}", session.log_file.display()));
        Ok(())
    }

    /// Print filtered log records until a trigger arrives or the tunnel
    /// process dies
    async fn follow<F>(&mut self, session: &Session, shutdown: &mut std::pin::Pin<&mut F>) -> Stop
    where
        F: Future<Output = TerminationTrigger>,
    {
        let mut follower = LogFollower::new(
            &session.log_file,
            self.config.poll_interval(),
            self.config.record_pace(),
        );
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

        loop {
            tokio::select! {
                trigger = shutdown.as_mut() => return Stop::Trigger(trigger),
                record = follower.next_record() => match record {
                    Ok(record) => println!("{record}"),
                    Err(e) => return Stop::Failure(e),
                },
                _ = liveness.tick() => {
                    if let Some(process) = self.process.as_mut() {
                        if !process.is_running() {
                            return Stop::Failure(RwtError::ProcessSupervision(format!(
                                "tunnel process {} exited unexpectedly",
                                process.pid()
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Undo every change of this session. Only the first call does
    /// anything; the failures it returns are already logged.
    pub fn rollback(&mut self) -> Vec<RwtError> {
        if !self.guard.try_begin() {
            log::debug!("Rollback already ran");
            return Vec::new();
        }

        let mut failures = Vec::new();

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.stop() {
                log::warn!("{e}");
                failures.push(RwtError::RollbackStep(e.to_string()));
            }
            status(format!("Tunnel process {} stopped", process.pid()));
        }

        failures.extend(self.journal.rollback(self.runner.as_ref()));

        if let Some(propagator) = self.propagator.as_mut() {
            failures.extend(propagator.revert_all());
        }

        if let Some(network) = self.network.as_mut() {
            failures.extend(network.revert());
        }

        self.lock = None;

        if failures.is_empty() {
            log::info!("Rollback finished");
        } else {
            log::warn!("Rollback finished with {} failed step(s)", failures.len());
        }
        failures
    }
}
