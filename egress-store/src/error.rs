//! Error types for the storage backends.

use deadpool_postgres::{CreatePoolError, PoolError};
use egress_queue::QueueError;
use egress_registry::RegistryError;
use thiserror::Error;

use crate::MigrationError;

/// Failures of the PostgreSQL backend.
///
/// Domain outcomes (missing rows, rejected writes) travel inside as
/// `Registry`/`Queue` and come back out unchanged when converted to the
/// trait-level error types. Everything else becomes a storage error.
#[derive(Debug, Error)]
pub enum PostgresError {
    #[error("invalid database url: {0}")]
    InvalidConfig(String),

    #[error("failed to create database pool: {0}")]
    PoolCreation(#[from] CreatePoolError),

    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("failed to map row: {0}")]
    Mapping(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<PostgresError> for RegistryError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Registry(err) => err,
            PostgresError::Queue(QueueError::Registry(err)) => err,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<PostgresError> for QueueError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Queue(err) => err,
            PostgresError::Registry(err) => Self::Registry(err),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Failure to build the configured stores.
#[derive(Debug, Error)]
pub enum StoreConfigError {
    #[error(transparent)]
    Postgres(#[from] PostgresError),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}
