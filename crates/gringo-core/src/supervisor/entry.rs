use std::{sync::Arc, time::SystemTime};

use gringo_types::ServiceSpec;
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;

use crate::{
    probe::ReadinessProbe,
    process_manager::ProcId,
    supervisor::SupervisorEvent,
    types::{ServiceState, ServiceStatus},
};

#[derive(Debug)]
pub(crate) struct Runtime {
    pub state: ServiceState,
    pub since: SystemTime,
    pub proc: Option<ProcId>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

/// Everything the supervisor keeps for one registered service.
#[derive(Debug)]
pub(crate) struct ServiceEntry {
    pub spec: ServiceSpec,
    /// Used instead of the probe described by `spec.probe`.
    pub probe: Option<Arc<dyn ReadinessProbe>>,
    /// Serializes start and stop of this service.
    pub op_lock: tokio::sync::Mutex<()>,
    pub runtime: Mutex<Runtime>,
    /// Cancels the start in progress, if any.
    pub start_cancel: Mutex<Option<CancellationToken>>,
    /// Cancels the exit watcher of a ready process, if any.
    pub watcher: Mutex<Option<CancellationToken>>,
}

impl ServiceEntry {
    pub fn new(spec: ServiceSpec, probe: Option<Arc<dyn ReadinessProbe>>) -> Self {
        Self {
            spec,
            probe,
            op_lock: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(Runtime {
                state: ServiceState::NotStarted,
                since: SystemTime::now(),
                proc: None,
                pid: None,
                port: None,
            }),
            start_cancel: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> ServiceState {
        self.runtime.lock().state.clone()
    }

    pub fn status(&self) -> ServiceStatus {
        let runtime = self.runtime.lock();
        ServiceStatus {
            name: self.spec.name.clone(),
            state: runtime.state.clone(),
            pid: runtime.pid,
            port: runtime.port,
            owned: self.spec.owned,
            since: runtime.since,
        }
    }

    pub fn transition(&self, state: ServiceState, events: &mpsc::Sender<SupervisorEvent>) {
        self.transition_if(|_| true, state, events);
    }

    /// Enter `state` only if `condition` accepts the current runtime. The
    /// condition runs under the runtime lock and may update it.
    pub fn transition_if(
        &self,
        condition: impl FnOnce(&mut Runtime) -> bool,
        state: ServiceState,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> bool {
        {
            let mut runtime = self.runtime.lock();
            if !condition(&mut runtime) {
                return false;
            }
            runtime.state = state.clone();
            runtime.since = SystemTime::now();
        }

        match &state {
            ServiceState::Failed(reason) => {
                tracing::warn!("Service `{}` failed: {reason}", self.name());
            }
            state => tracing::info!("Service `{}` is {state}", self.name()),
        }

        let event = SupervisorEvent::StateChanged {
            service: self.spec.name.clone(),
            state,
        };
        match events.try_send(event) {
            Ok(()) => {}
            // Output lines filled the channel; deliver once there is room.
            Err(TrySendError::Full(event)) => match Handle::try_current() {
                Ok(handle) => {
                    let events = events.clone();
                    handle.spawn(async move {
                        let _ = events.send(event).await;
                    });
                }
                Err(_) => {
                    tracing::debug!("State change of `{}` not delivered", self.name());
                }
            },
            Err(TrySendError::Closed(_)) => {}
        }

        true
    }
}
