//! Error types for queue operations.

use std::io;

use egress_registry::RegistryError;
use thiserror::Error;

use crate::MessageId;

/// Top-level queue error type.
///
/// Losing a claim race is not an error: it shows up as a smaller (possibly
/// empty) claimed batch. These variants cover genuine infrastructure failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Looking up egress addresses failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The host's network interfaces could not be enumerated.
    #[error("Failed to list host network addresses: {0}")]
    AddressList(#[source] io::Error),

    /// No queued message with this id exists.
    #[error("Queued message {0} not found")]
    MessageNotFound(MessageId),
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
