//! Termination triggers
//!
//! Handlers are installed before the first host mutation. From then on a
//! trigger no longer kills the process outright; it is queued until the
//! controller is ready to roll back.

use crate::error::Result;
use std::fmt;

/// What asked the session to end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationTrigger {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
}

impl fmt::Display for TerminationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationTrigger::Interrupt => "SIGINT",
            TerminationTrigger::Terminate => "SIGTERM",
            TerminationTrigger::Hangup => "SIGHUP",
            TerminationTrigger::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

#[cfg(unix)]
pub struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Wait for the next trigger
    pub async fn recv(&mut self) -> TerminationTrigger {
        let trigger = tokio::select! {
            _ = self.interrupt.recv() => TerminationTrigger::Interrupt,
            _ = self.terminate.recv() => TerminationTrigger::Terminate,
            _ = self.hangup.recv() => TerminationTrigger::Hangup,
            _ = self.quit.recv() => TerminationTrigger::Quit,
        };
        log::debug!("Received {trigger}");
        trigger
    }
}

#[cfg(not(unix))]
pub struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    pub fn install() -> Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> TerminationTrigger {
        match tokio::signal::ctrl_c().await {
            Ok(()) => TerminationTrigger::Interrupt,
            Err(e) => {
                log::warn!("Cannot listen for Ctrl+C: {e}");
                futures::future::pending().await
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_hangup_is_delivered_as_trigger() {
        let mut signals = TerminationSignals::install().unwrap();
        unsafe {
            libc::raise(libc::SIGHUP);
        }
        let trigger = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("trigger arrives");
        assert_eq!(trigger, TerminationTrigger::Hangup);
        assert_eq!(trigger.to_string(), "SIGHUP");
    }
}
