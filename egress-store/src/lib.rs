//! Storage backends for the egress registry and the shared queue
//!
//! Both backends implement [`RegistryStore`](egress_registry::RegistryStore)
//! and [`QueueStore`](egress_queue::QueueStore) on one object, so deleting an
//! address can check for queued rows that still reference it.
//!
//! - [`MemoryStore`] keeps everything in one process behind a lock. It is
//!   used by tests and single-host development setups.
//! - [`PostgresStore`] is the shared production store. Its claim is a single
//!   `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)` statement,
//!   so concurrent workers on any number of hosts never stamp the same row.

mod config;
mod error;
mod memory;
pub mod migrations;
mod postgres;

pub use config::{StoreConfig, Stores};
pub use error::{PostgresError, StoreConfigError};
pub use memory::MemoryStore;
pub use migrations::{MigrationError, run_migrations};
pub use postgres::PostgresStore;
