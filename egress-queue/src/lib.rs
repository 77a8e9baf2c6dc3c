//! Claiming and dequeueing of queued outbound messages
//!
//! Many workers, possibly on different hosts, poll one shared queue table.
//! Each poll cycle:
//! - works out which egress addresses this host may send from
//!   ([`HostAddressResolver`])
//! - atomically stamps a batch of eligible rows with a unique claim token
//!   ([`QueueClaimer`]) and reads back exactly the rows carrying that token
//! - hands each claimed row to the external processing callback in turn
//!   ([`DequeueDriver`])
//!
//! [`QueueWorker`] runs those cycles on a timer until shutdown.

mod claimer;
mod driver;
mod error;
mod message;
mod readiness;
mod resolver;
mod store;
mod token;
mod worker;

pub use claimer::{ClaimedBatch, QueueClaimer};
pub use driver::{BatchReport, DequeueDriver, MessageProcessor};
pub use error::{QueueError, Result};
pub use message::{MessageId, NewQueuedMessage, QueuedMessage};
pub use readiness::{DelayedRetry, ReadinessPredicate};
pub use resolver::{
    AddressLister, EligibleAddresses, HostAddressResolver, HostAddresses, StaticAddressLister,
    SystemAddressLister, is_excluded,
};
pub use store::{ClaimRequest, QueueStore};
pub use token::ClaimToken;
pub use worker::{CycleReport, QueueWorker, WorkerConfig};
