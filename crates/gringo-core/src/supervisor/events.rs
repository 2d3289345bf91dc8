use crate::types::ServiceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// One line written by an owned process.
    Log {
        service: String,
        stream: OutputStream,
        message: String,
    },
    StateChanged {
        service: String,
        state: ServiceState,
    },
}
