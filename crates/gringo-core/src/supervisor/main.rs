use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::StreamExt;
use gringo_types::{expand_port, PortSpec, ServiceSpec, SupervisorSettings, PORT_ENV};
use parking_lot::RwLock;
use tokio::{
    sync::mpsc,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    port::PortAllocator,
    probe::{build_probe, ProbeContext, ProbeResult, ReadinessProbe},
    process_manager::{BoxStream, CommandSpec, ProcId, ProcessManager},
    supervisor::{
        entry::ServiceEntry,
        events::{OutputStream, SupervisorEvent},
        report::StopReport,
    },
    types::{FailureReason, ServiceState, ServiceStatus},
};

const EVENTS_CAPACITY: usize = 256;
/// How long to wait for a process group to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Owns the lifecycle of a set of named services.
///
/// All methods take `&self`: different services can be started and stopped
/// concurrently, while calls for the same service are serialized.
#[derive(Debug)]
pub struct Supervisor<P: ProcessManager> {
    pub(super) process_manager: Arc<P>,
    settings: SupervisorSettings,
    allocator: PortAllocator,
    /// In registration order.
    services: RwLock<Vec<Arc<ServiceEntry>>>,
    events_tx: mpsc::Sender<SupervisorEvent>,
}

impl<P: ProcessManager + 'static> Supervisor<P> {
    pub fn new(
        process_manager: P,
        settings: SupervisorSettings,
    ) -> (Self, mpsc::Receiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CAPACITY);
        tracing::debug!("Supervisor created with {settings:?}");

        (
            Self {
                process_manager: Arc::new(process_manager),
                settings,
                allocator: PortAllocator::new(settings.port_attempts),
                services: RwLock::new(Vec::new()),
                events_tx,
            },
            events_rx,
        )
    }

    /// Register a service in the `NotStarted` state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an invalid spec and
    /// [`Error::DuplicateName`] if a service with that name exists and is not
    /// stopped.
    pub fn register(&self, spec: ServiceSpec) -> Result<()> {
        self.insert(spec, None)
    }

    /// Register a service that is probed with `probe` instead of the probe
    /// described by its spec.
    ///
    /// # Errors
    ///
    /// Same as [`Supervisor::register`].
    pub fn register_with_probe(
        &self,
        spec: ServiceSpec,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<()> {
        self.insert(spec, Some(probe))
    }

    fn insert(&self, spec: ServiceSpec, probe: Option<Arc<dyn ReadinessProbe>>) -> Result<()> {
        validate(&spec, probe.is_some())?;

        let mut services = self.services.write();
        if let Some(index) = services.iter().position(|e| e.name() == spec.name) {
            if !matches!(services[index].state(), ServiceState::Stopped { .. }) {
                return Err(Error::DuplicateName(spec.name));
            }
            services.remove(index);
        }

        tracing::info!("Registered service `{}`", spec.name);
        services.push(Arc::new(ServiceEntry::new(spec, probe)));
        Ok(())
    }

    /// Current status of a service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`] if `name` was never registered.
    pub fn status(&self, name: &str) -> Result<ServiceStatus> {
        Ok(self.entry(name)?.status())
    }

    /// Status of every registered service, in registration order.
    pub fn list(&self) -> Vec<ServiceStatus> {
        self.services.read().iter().map(|e| e.status()).collect()
    }

    /// Start a service and wait until it is ready or has failed.
    ///
    /// Startup failures are reported through the returned state, not as
    /// errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`] if `name` was never registered.
    pub async fn start(&self, name: &str) -> Result<ServiceState> {
        self.start_with_cancel(name, CancellationToken::new()).await
    }

    /// Like [`Supervisor::start`], but gives up waiting when `cancel` fires.
    /// A cancelled start tears down the process it launched and leaves the
    /// service `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`] if `name` was never registered.
    pub async fn start_with_cancel(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ServiceState> {
        let entry = self.entry(name)?;

        if let Some(state) = already_up(&entry) {
            return Ok(state);
        }

        let _op = entry.op_lock.lock().await;
        if let Some(state) = already_up(&entry) {
            return Ok(state);
        }

        let token = cancel.child_token();
        *entry.start_cancel.lock() = Some(token.clone());

        // A previous failed start may have left its process behind.
        let stale = entry.runtime.lock().proc.take();
        if let Some(id) = stale {
            if let Err(err) = terminate(
                self.process_manager.as_ref(),
                name,
                id,
                self.settings.grace_period,
            )
            .await
            {
                tracing::warn!("{err}");
            }
        }

        if token.is_cancelled() {
            entry.start_cancel.lock().take();
            let state = ServiceState::Failed(FailureReason::Cancelled);
            entry.transition(state.clone(), &self.events_tx);
            return Ok(state);
        }

        entry.transition_if(
            |runtime| {
                runtime.proc = None;
                runtime.pid = None;
                runtime.port = None;
                true
            },
            ServiceState::Starting,
            &self.events_tx,
        );

        let mut guard = StartGuard {
            entry: entry.clone(),
            process_manager: self.process_manager.clone(),
            events_tx: self.events_tx.clone(),
            grace_period: self.settings.grace_period,
            armed: true,
        };
        let state = self.run_start(&entry, &token).await;
        guard.armed = false;

        entry.start_cancel.lock().take();
        entry.transition(state.clone(), &self.events_tx);

        let proc = entry.runtime.lock().proc;
        if let (ServiceState::Ready, Some(id)) = (&state, proc) {
            self.watch(entry.clone(), id);
        }

        Ok(state)
    }

    /// Like [`Supervisor::start`], but a failed start is returned as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`], or the error matching the failure
    /// reason.
    pub async fn start_strict(&self, name: &str) -> Result<()> {
        match self.start(name).await? {
            ServiceState::Failed(reason) => Err(reason.into_error(name)),
            _ => Ok(()),
        }
    }

    /// Stop a service. Owned processes get SIGTERM, then SIGKILL after the
    /// grace period. External services are only marked stopped. Stopping a
    /// stopped service does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`], or [`Error::Stop`] if the process
    /// could not be terminated. The service is `Stopped` either way.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;

        if let Some(token) = entry.start_cancel.lock().take() {
            token.cancel();
        }
        if let Some(token) = entry.watcher.lock().take() {
            token.cancel();
        }

        let _op = entry.op_lock.lock().await;

        let proc = {
            let mut runtime = entry.runtime.lock();
            runtime.pid = None;
            runtime.proc.take()
        };

        let Some(id) = proc else {
            entry.transition_if(
                |runtime| !matches!(runtime.state, ServiceState::Stopped { .. }),
                ServiceState::Stopped { exit_code: None },
                &self.events_tx,
            );
            return Ok(());
        };

        tracing::info!("Stopping service `{name}`");
        let result = terminate(
            self.process_manager.as_ref(),
            name,
            id,
            self.settings.grace_period,
        )
        .await;

        let exit_code = result.as_ref().ok().copied().flatten();
        entry.transition(ServiceState::Stopped { exit_code }, &self.events_tx);

        result.map(|_| ())
    }

    /// Stop every service in reverse registration order, carrying on past
    /// individual failures.
    pub async fn stop_all(&self) -> StopReport {
        let names: Vec<String> = self
            .services
            .read()
            .iter()
            .rev()
            .map(|e| e.name().to_owned())
            .collect();

        let mut report = StopReport::default();
        for name in names {
            match self.stop(&name).await {
                Ok(()) => report.stopped.push(name),
                Err(err) => {
                    tracing::error!("Failed to stop `{name}`: {err}");
                    report.stopped.push(name);
                    report.failures.push(err);
                }
            }
        }
        report
    }

    fn entry(&self, name: &str) -> Result<Arc<ServiceEntry>> {
        self.services
            .read()
            .iter()
            .find(|e| e.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownService(name.to_owned()))
    }

    /// Launch (if owned) and poll until ready, failed or cancelled.
    async fn run_start(&self, entry: &ServiceEntry, token: &CancellationToken) -> ServiceState {
        let spec = &entry.spec;

        let port = match self.resolve_port(spec) {
            Ok(port) => port,
            Err(reason) => return ServiceState::Failed(reason),
        };
        entry.runtime.lock().port = port;

        let probe = match &entry.probe {
            Some(probe) => probe.clone(),
            None => match build_probe(spec, port) {
                Ok(probe) => probe,
                Err(err) => {
                    return ServiceState::Failed(FailureReason::Configuration(err.to_string()))
                }
            },
        };

        let proc = if spec.owned {
            match self.launch(entry, port).await {
                Ok(id) => Some(id),
                Err(err) => {
                    let reason = match err {
                        Error::ProcessSpawn { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    return ServiceState::Failed(FailureReason::Spawn(reason));
                }
            }
        } else {
            None
        };

        let deadline = Instant::now() + spec.timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let exit = match proc {
                Some(id) => self.exit_code(&spec.name, id).await,
                None => None,
            };
            let ctx = ProbeContext {
                process_alive: proc.map(|_| exit.is_none()),
            };

            // No attempt may run past the startup deadline.
            let attempt_timeout = spec
                .probe_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let result = tokio::select! {
                biased;
                () = token.cancelled() => return self.cancelled(entry).await,
                result = tokio::time::timeout(attempt_timeout, probe.probe(&ctx)) => {
                    result.unwrap_or_else(|_| ProbeResult::now(false))
                }
            };

            if result.success {
                tracing::debug!("Service `{}` ready after {attempt} probe(s)", spec.name);
                return ServiceState::Ready;
            }
            if exit.is_some() {
                return ServiceState::Failed(FailureReason::ProcessExited(exit));
            }

            let now = Instant::now();
            if now >= deadline {
                return ServiceState::Failed(FailureReason::Timeout(spec.timeout));
            }

            tracing::trace!("Service `{}` not ready (attempt {attempt})", spec.name);
            tokio::select! {
                biased;
                () = token.cancelled() => return self.cancelled(entry).await,
                () = sleep(self.settings.poll_interval.min(deadline - now)) => {}
            }
        }
    }

    fn resolve_port(&self, spec: &ServiceSpec) -> std::result::Result<Option<u16>, FailureReason> {
        match spec.port {
            None => Ok(None),
            Some(PortSpec::Fixed(port)) => Ok(Some(port)),
            Some(PortSpec::Allocate { from }) => match self.allocator.allocate(from) {
                Ok(port) => Ok(Some(port)),
                Err(Error::NoPortAvailable { from, attempts }) => {
                    Err(FailureReason::NoPortAvailable { from, attempts })
                }
                Err(err) => Err(FailureReason::Configuration(err.to_string())),
            },
        }
    }

    async fn launch(&self, entry: &ServiceEntry, port: Option<u16>) -> Result<ProcId> {
        let spec = &entry.spec;
        let mut env: BTreeMap<String, String> = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_port(v, port)))
            .collect();
        if let Some(port) = port {
            env.insert(PORT_ENV.to_owned(), port.to_string());
        }

        let spawned = self
            .process_manager
            .spawn(CommandSpec {
                name: spec.name.clone(),
                cmd: spec.cmd.iter().map(|arg| expand_port(arg, port)).collect(),
                cwd: spec.cwd.clone(),
                env,
            })
            .await?;

        {
            let mut runtime = entry.runtime.lock();
            runtime.proc = Some(spawned.id);
            runtime.pid = spawned.pid;
        }

        self.forward_output(&spec.name, spawned.stdout, OutputStream::Stdout);
        self.forward_output(&spec.name, spawned.stderr, OutputStream::Stderr);

        Ok(spawned.id)
    }

    async fn exit_code(&self, name: &str, id: ProcId) -> Option<i32> {
        match self.process_manager.wait(id, Duration::ZERO).await {
            Ok(code) => code,
            Err(err) => {
                tracing::warn!("Cannot check process of `{name}`: {err}");
                None
            }
        }
    }

    async fn cancelled(&self, entry: &ServiceEntry) -> ServiceState {
        tracing::info!("Start of `{}` cancelled", entry.name());

        let proc = {
            let mut runtime = entry.runtime.lock();
            runtime.pid = None;
            runtime.proc.take()
        };
        if let Some(id) = proc {
            if let Err(err) = terminate(
                self.process_manager.as_ref(),
                entry.name(),
                id,
                self.settings.grace_period,
            )
            .await
            {
                tracing::error!("{err}");
            }
        }

        ServiceState::Failed(FailureReason::Cancelled)
    }

    fn forward_output(&self, service: &str, mut lines: BoxStream<String>, stream: OutputStream) {
        let events_tx = self.events_tx.clone();
        let service = service.to_owned();

        tokio::spawn(async move {
            let mut delivered = true;
            while let Some(message) = lines.next().await {
                // Keep draining after the receiver is gone so the process
                // never blocks on a full pipe.
                if delivered {
                    delivered = events_tx
                        .send(SupervisorEvent::Log {
                            service: service.clone(),
                            stream,
                            message,
                        })
                        .await
                        .is_ok();
                }
            }
            tracing::debug!("Output {stream:?} of `{service}` closed");
        });
    }

    /// Move a ready service to `Stopped` when its process exits on its own.
    fn watch(&self, entry: Arc<ServiceEntry>, id: ProcId) {
        let token = CancellationToken::new();
        if let Some(previous) = entry.watcher.lock().replace(token.clone()) {
            previous.cancel();
        }

        let process_manager = self.process_manager.clone();
        let events_tx = self.events_tx.clone();
        let interval = self.settings.poll_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = sleep(interval) => {}
                }

                match process_manager.wait(id, Duration::ZERO).await {
                    Ok(None) => {}
                    Ok(Some(code)) => {
                        let taken = entry.transition_if(
                            |runtime| {
                                if runtime.proc != Some(id) {
                                    return false;
                                }
                                runtime.proc = None;
                                runtime.pid = None;
                                true
                            },
                            ServiceState::Stopped {
                                exit_code: Some(code),
                            },
                            &events_tx,
                        );
                        if taken {
                            tracing::warn!(
                                "Service `{}` exited unexpectedly with code {code}",
                                entry.name()
                            );
                            process_manager.release(id);
                        }
                        return;
                    }
                    Err(err) => {
                        tracing::debug!("Stopped watching `{}`: {err}", entry.name());
                        return;
                    }
                }
            }
        });
    }
}

impl<P: ProcessManager> Drop for Supervisor<P> {
    fn drop(&mut self) {
        for entry in self.services.get_mut().iter() {
            if let Some(token) = entry.watcher.lock().take() {
                token.cancel();
            }
        }
    }
}

fn already_up(entry: &ServiceEntry) -> Option<ServiceState> {
    let state = entry.state();
    matches!(state, ServiceState::Ready | ServiceState::Starting).then_some(state)
}

fn validate(spec: &ServiceSpec, custom_probe: bool) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::Configuration {
            service: spec.name.clone(),
            reason: reason.to_owned(),
        })
    };

    if spec.name.trim().is_empty() {
        return invalid("name is empty");
    }
    if spec.timeout.is_zero() {
        return invalid("startup timeout must be positive");
    }
    if spec.probe_timeout.is_zero() {
        return invalid("probe timeout must be positive");
    }
    if spec.owned && spec.cmd.is_empty() {
        return invalid("cmd is empty");
    }
    if spec.cmd.iter().any(|arg| arg.trim().is_empty()) {
        return invalid("cmd contains empty element");
    }

    if !custom_probe {
        let port = spec.port.map(|port| match port {
            PortSpec::Fixed(port) | PortSpec::Allocate { from: port } => port,
        });
        build_probe(spec, port)?;
    }

    Ok(())
}

/// SIGTERM, wait for the grace period, then SIGKILL. Returns the exit code.
async fn terminate<P: ProcessManager + ?Sized>(
    process_manager: &P,
    name: &str,
    id: ProcId,
    grace_period: Duration,
) -> Result<Option<i32>> {
    let stop_error = |reason: String| Error::Stop {
        service: name.to_owned(),
        reason,
    };

    let result: Result<Option<i32>> = async {
        process_manager
            .shutdown(id)
            .await
            .map_err(|err| stop_error(format!("SIGTERM failed: {err}")))?;

        if let Some(code) = process_manager
            .wait(id, grace_period)
            .await
            .map_err(|err| stop_error(err.to_string()))?
        {
            return Ok(Some(code));
        }

        tracing::warn!("Service `{name}` ignored SIGTERM for {grace_period:?}, killing it");
        process_manager
            .kill(id)
            .await
            .map_err(|err| stop_error(format!("SIGKILL failed: {err}")))?;

        match process_manager
            .wait(id, KILL_WAIT)
            .await
            .map_err(|err| stop_error(err.to_string()))?
        {
            Some(code) => Ok(Some(code)),
            None => Err(stop_error("process did not exit after SIGKILL".to_owned())),
        }
    }
    .await;

    process_manager.release(id);
    result
}

/// Leaves the service `Failed` when a start future is dropped mid-way.
struct StartGuard<P: ProcessManager + 'static> {
    entry: Arc<ServiceEntry>,
    process_manager: Arc<P>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    grace_period: Duration,
    armed: bool,
}

impl<P: ProcessManager + 'static> Drop for StartGuard<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.entry.start_cancel.lock().take();

        let mut proc = None;
        let abandoned = self.entry.transition_if(
            |runtime| {
                if runtime.state != ServiceState::Starting {
                    return false;
                }
                runtime.pid = None;
                proc = runtime.proc.take();
                true
            },
            ServiceState::Failed(FailureReason::Cancelled),
            &self.events_tx,
        );

        if let (true, Some(id)) = (abandoned, proc) {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let process_manager = self.process_manager.clone();
            let name = self.entry.name().to_owned();
            let grace_period = self.grace_period;
            handle.spawn(async move {
                if let Err(err) =
                    terminate(process_manager.as_ref(), &name, id, grace_period).await
                {
                    tracing::error!("{err}");
                }
            });
        }
    }
}
