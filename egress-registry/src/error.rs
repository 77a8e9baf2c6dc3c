//! Error types for registry operations.
//!
//! Validation failures are kept apart from lookup and storage failures so
//! that administrative callers can report a rejected write differently from
//! a broken database.

use thiserror::Error;

use crate::{AddressId, PoolId};

/// A write was rejected because the record would break a registry invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or blank.
    #[error("{0} can't be blank")]
    Blank(&'static str),

    /// An integer field is outside its allowed range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },

    /// A textual IP address does not parse as the expected family.
    #[error("{field} {value:?} is not a valid {family} address")]
    InvalidAddress {
        field: &'static str,
        value: String,
        family: &'static str,
    },

    /// A field that must be unique collides with an existing record.
    #[error("{field} {value:?} has already been taken")]
    Taken { field: &'static str, value: String },

    /// Proxy pools can never be the default pool.
    #[error("default cannot be true for proxy pools")]
    ProxyPoolDefault,

    /// Pool type string is neither `local` nor `proxy`.
    #[error("unknown pool type {0:?}")]
    UnknownPoolType(String),
}

/// Top-level registry error type.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The write was rejected by validation.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No pool with this id exists.
    #[error("IP pool {0} not found")]
    PoolNotFound(PoolId),

    /// No address with this id exists.
    #[error("IP address {0} not found")]
    AddressNotFound(AddressId),

    /// The pool still owns addresses and cannot be deleted.
    #[error("IP pool {id} still has {addresses} address(es)")]
    PoolInUse { id: PoolId, addresses: usize },

    /// Queued messages still reference the address.
    #[error("IP address {id} is referenced by {queued} queued message(s)")]
    AddressInUse { id: AddressId, queued: u64 },

    /// The backing store failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RegistryError {
    /// Returns `true` if the write was rejected by validation.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns `true` if the referenced record does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::PoolNotFound(_) | Self::AddressNotFound(_))
    }

    /// Returns `true` if the operation was refused because other records depend on the target.
    #[must_use]
    pub const fn is_in_use(&self) -> bool {
        matches!(self, Self::PoolInUse { .. } | Self::AddressInUse { .. })
    }
}

/// Specialized `Result` type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
