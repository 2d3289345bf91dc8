use crate::error::Error;

/// Outcome of [`Supervisor::stop_all`](super::Supervisor::stop_all).
#[derive(Debug, Default)]
pub struct StopReport {
    /// Services in the order they were stopped.
    pub stopped: Vec<String>,
    pub failures: Vec<Error>,
}

impl StopReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}
