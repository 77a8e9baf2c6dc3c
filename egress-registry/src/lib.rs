//! Egress address registry
//!
//! This crate owns the records describing where outbound mail may leave from:
//! - IP pools, each either `local` (addresses bound on worker hosts) or
//!   `proxy` (remote SOCKS5 endpoints usable from any host)
//! - IP addresses belonging to a pool, with their priority and, for proxy
//!   pools, the connection details and latest verification outcome
//! - Write-time validation of both record kinds
//! - Priority-weighted selection of an address within a pool

mod address;
mod error;
mod pool;
mod selection;
mod store;
pub mod validation;

pub use address::{
    AddressDraft, AddressId, AddressParams, DEFAULT_PRIORITY, DEFAULT_PROXY_PORT, IpAddress,
    VerificationRecord, VerificationStatus,
};
pub use error::{RegistryError, Result, ValidationError};
pub use pool::{IpPool, NewPool, PoolId, PoolType, PoolUpdate};
pub use selection::{select_by_priority, select_for_pool};
pub use store::RegistryStore;
