#[cfg(test)]
mod mock;
#[cfg(unix)]
mod unix;

#[cfg(test)]
pub use mock::{MockBehavior, MockProcessManager};
#[cfg(unix)]
pub use unix::UnixProcessManager;
