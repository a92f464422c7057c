//! Error types and handling for the tunnel session

use thiserror::Error;

/// Main error type for tunnel session operations
#[derive(Error, Debug)]
pub enum RwtError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not running with administrative privileges
    #[error("Permission error: {0}")]
    Privilege(String),

    /// Host architecture has no matching tunnel binary
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// No release asset matches the host
    #[error("Release resolution failed: {0}")]
    Resolution(String),

    /// Release asset could not be fetched
    #[error("Download failed: {0}")]
    Download(String),

    /// A tunnel interface or routing step failed
    #[error("Interface configuration error: {0}")]
    InterfaceConfig(String),

    /// A proxy target could not be applied
    #[error("Proxy propagation error: {0}")]
    ProxyPropagation(String),

    /// The tunnel binary could not be started or controlled
    #[error("Process supervision error: {0}")]
    ProcessSupervision(String),

    /// The tunnel binary did not become ready in time
    #[error("Startup timed out: {0}")]
    StartupTimeout(String),

    /// A single rollback step failed
    #[error("Rollback step failed: {0}")]
    RollbackStep(String),

    /// Another session holds the lock
    #[error("Session already active: {0}")]
    SessionActive(String),

    /// External command failed
    #[error("Command failed: {0}")]
    Command(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RwtError {
    /// Errors raised before any host state is touched. These exit with
    /// status 1 and need no rollback.
    pub fn is_fatal_before_mutation(&self) -> bool {
        matches!(
            self,
            RwtError::Config(_)
                | RwtError::Privilege(_)
                | RwtError::UnsupportedArchitecture(_)
                | RwtError::Resolution(_)
                | RwtError::Download(_)
                | RwtError::SessionActive(_)
        )
    }
}

/// Result type alias for tunnel session operations
pub type Result<T> = std::result::Result<T, RwtError>;

/// Helper trait for converting errors to RwtError
pub trait IntoRwtError<T> {
    fn into_rwt_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoRwtError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_rwt_error(self, context: &str) -> Result<T> {
        self.map_err(|e| RwtError::Command(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for RwtError {
    fn from(err: toml::de::Error) -> Self {
        RwtError::Config(format!("TOML parsing error: {err}"))
    }
}
