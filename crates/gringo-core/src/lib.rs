mod error;
mod port;
mod probe;
mod process_manager;
mod supervisor;
mod types;

pub use error::{Error, Result};
pub use port::PortAllocator;
pub use probe::{
    build_probe, HttpProbe, ProbeContext, ProbeResult, ProcessAliveProbe, ReadinessProbe,
    TcpProbe,
};
#[cfg(unix)]
pub use process_manager::UnixProcessManager;
pub use process_manager::{BoxStream, CommandSpec, ProcId, ProcessManager, Spawned};
pub use supervisor::{OutputStream, StopReport, Supervisor, SupervisorEvent};
pub use tokio_util::sync::CancellationToken;
pub use types::{FailureReason, ServiceState, ServiceStatus};
