pub mod logging;
pub mod stop;

pub use tracing;

pub use crate::{
    logging::LogConfig,
    stop::{StopHandle, StopToken},
};

/// Process-wide lifecycle signals, broadcast from the binary to every
/// long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop taking new work, finish what is in flight and exit.
    Shutdown,
}
