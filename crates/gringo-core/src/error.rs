use std::time::Duration;

pub type Result<R, E = Error> = std::result::Result<R, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration for service `{service}`: {reason}")]
    Configuration { service: String, reason: String },

    #[error("service `{0}` is already registered")]
    DuplicateName(String),

    #[error("unknown service `{0}`")]
    UnknownService(String),

    #[error("service `{service}` did not become ready within {timeout:?}")]
    StartupTimeout { service: String, timeout: Duration },

    #[error("service `{service}` exited before becoming ready (code {code:?})")]
    ProcessExited { service: String, code: Option<i32> },

    #[error("failed to spawn service `{service}`: {reason}")]
    ProcessSpawn { service: String, reason: String },

    #[error("start of service `{0}` was cancelled")]
    Cancelled(String),

    #[error("failed to stop service `{service}`: {reason}")]
    Stop { service: String, reason: String },

    #[error("no free port among {attempts} ports starting at {from}")]
    NoPortAvailable { from: u16, attempts: u16 },

    #[error("unknown process id {0}")]
    UnknownProcess(u64),

    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}
