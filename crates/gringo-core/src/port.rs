use std::net::{Ipv4Addr, TcpListener};

use crate::error::{Error, Result};

/// Finds free loopback ports by binding and immediately releasing them.
///
/// Allocation is best effort: another process may grab the port between
/// allocation and the moment the service binds it.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    attempts: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(100)
    }
}

impl PortAllocator {
    #[must_use]
    pub fn new(attempts: u16) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }

    /// Returns the first bindable port at or above `preferred`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPortAvailable`] when none of the tried ports can be
    /// bound.
    pub fn allocate(&self, preferred: u16) -> Result<u16> {
        let last = preferred.saturating_add(self.attempts - 1);
        for port in preferred..=last {
            if port == 0 {
                continue;
            }
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                Ok(listener) => {
                    drop(listener);
                    tracing::debug!("Allocated port {port}");
                    return Ok(port);
                }
                Err(err) => tracing::trace!("Port {port} unavailable: {err}"),
            }
        }

        Err(Error::NoPortAvailable {
            from: preferred,
            attempts: self.attempts,
        })
    }
}
