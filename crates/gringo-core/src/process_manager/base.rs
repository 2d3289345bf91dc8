use std::time::Duration;

use crate::{
    error::Result,
    process_manager::types::{CommandSpec, ProcId, Spawned},
};

#[async_trait::async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new process in its own process group.
    async fn spawn(&self, spec: CommandSpec) -> Result<Spawned>;
    /// Gracefully shutdown a process group.
    async fn shutdown(&self, id: ProcId) -> Result<()>;
    /// Wait up to `d` for a process to exit. Returns the exit code once it
    /// has exited, and keeps returning it until the process is released.
    async fn wait(&self, id: ProcId, d: Duration) -> Result<Option<i32>>;
    /// Forcefully kill a process group.
    async fn kill(&self, id: ProcId) -> Result<()>;
    /// Forget about a process. Unknown ids are ignored.
    fn release(&self, id: ProcId);
}
