//! Egress worker application
//!
//! Ties the registry, queue and proxy crates to a RON configuration file:
//! [`Egress`] builds the stores, the polling worker and the proxy verifier,
//! and [`Egress::run`] drives the worker until the process is signalled.

pub mod admin;
mod config;
pub mod controller;
pub mod processor;

pub use config::{CONFIG_ENV, ConfigError, DEFAULT_CONFIG_PATHS, Egress, locate_config};
pub use processor::{CommandProcessor, LogProcessor, ProcessorConfig};
