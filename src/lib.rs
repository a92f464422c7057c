//! PdaNet+ reverse wireless tethering
//!
//! Routes all host traffic through the HTTP/SOCKS5 proxy that a phone
//! running PdaNet+ exposes over Wi-Fi Direct. The heavy lifting is done by
//! an external tun2socks binary (`hev-socks5-tunnel`); this crate manages
//! everything around it:
//!
//! - Resolving and caching the tunnel binary for the host architecture
//! - Creating the TUN device and rerouting the default route through it
//! - Propagating the proxy to package managers, desktop and CLI tools
//! - Supervising the tunnel process and following its log
//! - Restoring every change on exit, exactly once
//!
//! ## Layout
//! - [`lifecycle`] drives a session through its states
//! - [`journal`] records the inverse of every host mutation
//! - [`command`] is the seam all host commands go through

pub mod command;
pub mod config;
pub mod emitter;
pub mod error;
pub mod journal;
pub mod lifecycle;
pub mod logfilter;
pub mod network;
pub mod proxy;
pub mod resolver;
pub mod session;
pub mod signals;
pub mod supervisor;

pub use command::{CommandRunner, SystemCommandRunner};
pub use config::Config;
pub use error::{Result, RwtError};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use session::{Architecture, HostFacts, Session};
pub use signals::{TerminationSignals, TerminationTrigger};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
