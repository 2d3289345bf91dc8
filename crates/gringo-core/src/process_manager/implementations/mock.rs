use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    error::{Error, Result},
    process_manager::{
        base::ProcessManager,
        types::{CommandSpec, ProcId, Spawned},
    },
};

/// How a fake process reacts, keyed by service name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Runs until shut down.
    #[default]
    Run,
    /// Exits on its own with the code after the delay.
    ExitAfter(Duration, i32),
    /// The spawn itself fails.
    FailSpawn,
    /// Ignores SIGTERM, only SIGKILL ends it.
    IgnoreShutdown,
    /// Survives both SIGTERM and SIGKILL.
    Unkillable,
}

#[derive(Debug)]
struct MockProc {
    behavior: MockBehavior,
    spawned_at: Instant,
    exit: Option<i32>,
}

#[derive(Debug, Default)]
pub struct MockProcessManager {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    processes: Mutex<HashMap<ProcId, MockProc>>,
    names: Mutex<HashMap<ProcId, String>>,
    calls: Mutex<Vec<String>>,
    spawned: Mutex<Vec<CommandSpec>>,
}

impl MockProcessManager {
    pub fn with_behavior(self, name: &str, behavior: MockBehavior) -> Self {
        self.behaviors.lock().insert(name.to_owned(), behavior);
        self
    }

    /// Every call as `"<op> <service>"`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Every command passed to `spawn`, in order.
    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.spawned.lock().clone()
    }

    fn record(&self, op: &str, id: ProcId) {
        let name = self.names.lock().get(&id).cloned().unwrap_or_default();
        self.calls.lock().push(format!("{op} {name}"));
    }

    fn poll_exit(&self, id: ProcId) -> Result<Option<i32>> {
        let mut processes = self.processes.lock();
        let proc = processes.get_mut(&id).ok_or(Error::UnknownProcess(id.0))?;
        if proc.exit.is_none() {
            if let MockBehavior::ExitAfter(delay, code) = proc.behavior {
                if proc.spawned_at.elapsed() >= delay {
                    proc.exit = Some(code);
                }
            }
        }
        Ok(proc.exit)
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    async fn spawn(&self, spec: CommandSpec) -> Result<Spawned> {
        self.calls.lock().push(format!("spawn {}", spec.name));
        self.spawned.lock().push(spec.clone());
        let behavior = self
            .behaviors
            .lock()
            .get(&spec.name)
            .copied()
            .unwrap_or_default();

        if behavior == MockBehavior::FailSpawn {
            return Err(Error::ProcessSpawn {
                service: spec.name,
                reason: "No such file or directory".to_owned(),
            });
        }

        let id = {
            let mut processes = self.processes.lock();
            let id = ProcId(processes.len() as u64);
            processes.insert(
                id,
                MockProc {
                    behavior,
                    spawned_at: Instant::now(),
                    exit: None,
                },
            );
            id
        };
        self.names.lock().insert(id, spec.name);

        Ok(Spawned {
            id,
            pid: Some(1000 + u32::try_from(id.0).unwrap_or_default()),
            stdout: Box::pin(futures::stream::empty()),
            stderr: Box::pin(futures::stream::empty()),
        })
    }

    async fn shutdown(&self, id: ProcId) -> Result<()> {
        self.record("shutdown", id);
        let mut processes = self.processes.lock();
        let proc = processes.get_mut(&id).ok_or(Error::UnknownProcess(id.0))?;
        let ignores = matches!(
            proc.behavior,
            MockBehavior::IgnoreShutdown | MockBehavior::Unkillable
        );
        if !ignores && proc.exit.is_none() {
            proc.exit = Some(128 + libc::SIGTERM);
        }
        Ok(())
    }

    async fn wait(&self, id: ProcId, d: Duration) -> Result<Option<i32>> {
        let start = Instant::now();
        loop {
            if let Some(code) = self.poll_exit(id)? {
                return Ok(Some(code));
            }
            let elapsed = start.elapsed();
            if elapsed >= d {
                return Ok(None);
            }
            sleep(Duration::from_millis(10).min(d - elapsed)).await;
        }
    }

    async fn kill(&self, id: ProcId) -> Result<()> {
        self.record("kill", id);
        let mut processes = self.processes.lock();
        let proc = processes.get_mut(&id).ok_or(Error::UnknownProcess(id.0))?;
        if proc.behavior != MockBehavior::Unkillable && proc.exit.is_none() {
            proc.exit = Some(128 + libc::SIGKILL);
        }
        Ok(())
    }

    fn release(&self, id: ProcId) {
        self.record("release", id);
    }
}
