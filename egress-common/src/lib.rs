//! Pieces shared by every egress crate: log bootstrap and macros, the
//! shutdown signal broadcast between components, and the liveness tracker a
//! supervisor uses to spot stalled workers.

pub mod liveness;
pub mod logging;

pub use liveness::Liveness;
pub use logging::LogConfig;
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
