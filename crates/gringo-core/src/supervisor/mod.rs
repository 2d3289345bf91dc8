mod entry;
mod events;
mod main;
mod report;

pub use events::{OutputStream, SupervisorEvent};
pub use main::Supervisor;
pub use report::StopReport;
