//! Proxy egress verification
//!
//! A proxy-pool address is only trusted for delivery once a tunnel through it
//! has reached a health-check target. [`ProxyVerifier`] opens that tunnel with
//! the [`socks5`] client, runs the configured [`Probe`] through it and persists
//! the outcome onto the address.

pub mod health;
pub mod socks5;
mod verifier;

pub use health::{HealthCheckTarget, Probe, ProbeError};
pub use socks5::{Credentials, ProxyConfig, ReplyCode, Socks5Error, TargetAddr};
pub use verifier::{
    MAX_VERIFICATION_ERROR_CHARS, ProxyVerifier, Verification, VerifierConfig, VerifyError,
};
