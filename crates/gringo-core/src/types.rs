use std::{fmt, time::Duration, time::SystemTime};

use crate::error::Error;

/// Why a service ended up [`ServiceState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The probe never succeeded within the startup timeout.
    Timeout(Duration),
    /// The owned process exited before becoming ready.
    ProcessExited(Option<i32>),
    /// The command could not be launched.
    Spawn(String),
    /// No port could be allocated.
    NoPortAvailable { from: u16, attempts: u16 },
    /// The probe could not be built for the resolved port.
    Configuration(String),
    /// The start was cancelled or abandoned.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout(timeout) => write!(f, "timeout after {timeout:?}"),
            FailureReason::ProcessExited(Some(code)) => write!(f, "process exited (code {code})"),
            FailureReason::ProcessExited(None) => write!(f, "process exited"),
            FailureReason::Spawn(reason) => write!(f, "spawn failed: {reason}"),
            FailureReason::NoPortAvailable { from, attempts } => {
                write!(f, "no free port among {attempts} ports starting at {from}")
            }
            FailureReason::Configuration(reason) => write!(f, "invalid probe: {reason}"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FailureReason {
    pub(crate) fn into_error(self, service: &str) -> Error {
        let service = service.to_owned();
        match self {
            FailureReason::Timeout(timeout) => Error::StartupTimeout { service, timeout },
            FailureReason::ProcessExited(code) => Error::ProcessExited { service, code },
            FailureReason::Spawn(reason) => Error::ProcessSpawn { service, reason },
            FailureReason::NoPortAvailable { from, attempts } => {
                Error::NoPortAvailable { from, attempts }
            }
            FailureReason::Configuration(reason) => Error::Configuration { service, reason },
            FailureReason::Cancelled => Error::Cancelled(service),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    Starting,
    Ready,
    Failed(FailureReason),
    /// Stopped on request, or the owned process exited after becoming ready
    /// (with its exit code).
    Stopped { exit_code: Option<i32> },
}

impl ServiceState {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, ServiceState::Failed(_))
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::NotStarted => "not started",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::Failed(_) => "failed",
            ServiceState::Stopped { .. } => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Failed(reason) => write!(f, "failed: {reason}"),
            ServiceState::Stopped {
                exit_code: Some(code),
            } => write!(f, "stopped (exit code {code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Point-in-time view of one registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub owned: bool,
    /// When `state` was entered.
    pub since: SystemTime,
}
