use std::{num::NonZeroU32, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use egress_common::internal;
use egress_registry::{AddressId, IpAddress, RegistryError, RegistryStore, VerificationRecord};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::{HealthCheckTarget, ProbeError, ProxyConfig, Socks5Error, socks5};

/// Longest `verification_error` persisted, in characters
pub const MAX_VERIFICATION_ERROR_CHARS: usize = 255;

const LOCAL_POOL_REASON: &str = "Only addresses in proxy pools can be verified";

const fn default_timeout() -> u64 {
    10_000
}

const fn default_max_attempts() -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(2)
}

const fn default_backoff() -> u64 {
    1_000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerifierConfig {
    /// Endpoint probed through the proxy
    #[serde(default)]
    pub target: HealthCheckTarget,

    /// Bound on one attempt, connect to probe response (in milliseconds)
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Tunnels opened before giving up; zero is rejected when deserialising
    #[serde(default = "default_max_attempts")]
    pub max_attempts: NonZeroU32,

    /// Pause between failed attempts (in milliseconds)
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            target: HealthCheckTarget::default(),
            timeout_ms: default_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
        }
    }
}

/// Result of one `verify` call, already persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { at: DateTime<Utc> },
    Failed { reason: String },
}

impl Verification {
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

/// Failure of the verification operation itself, as opposed to the proxy
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("IP address {0} not found")]
    AddressNotFound(AddressId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Proxy(#[from] Socks5Error),

    #[error("Health check failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Timed out after {0}ms")]
    Timeout(u64),
}

/// Verifies proxy egress paths and records the outcome on the address
#[derive(Debug, Clone)]
pub struct ProxyVerifier {
    registry: Arc<dyn RegistryStore>,
    config: VerifierConfig,
}

impl ProxyVerifier {
    #[must_use]
    pub fn new(registry: Arc<dyn RegistryStore>, config: VerifierConfig) -> Self {
        Self { registry, config }
    }

    #[must_use]
    pub const fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Probe the proxy behind `id` and persist the outcome.
    ///
    /// Up to `max_attempts` tunnels are opened, each bounded by `timeout_ms`,
    /// with `backoff_ms` between them. The first success stamps `verified_at`
    /// and clears any previous error. If every attempt fails, `verified_at`
    /// is cleared and only the last error is stored.
    ///
    /// Local-pool addresses are reported as failed and left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not exist or the outcome cannot be
    /// stored. An unhealthy proxy is an `Ok(Verification::Failed)`.
    #[instrument(skip(self), fields(attempts = self.config.max_attempts.get()))]
    pub async fn verify(&self, id: AddressId) -> Result<Verification, VerifyError> {
        let address = self
            .registry
            .address(id)
            .await?
            .ok_or(VerifyError::AddressNotFound(id))?;

        if !address.is_proxy() {
            tracing::debug!(address_id = id, "Skipping verification of local-pool address");
            return Ok(Verification::Failed {
                reason: LOCAL_POOL_REASON.to_string(),
            });
        }

        let outcome = match ProxyConfig::from_address(&address) {
            Ok(proxy) => self.attempts(&address, &proxy).await,
            Err(err) => Err(AttemptError::Proxy(err)),
        };

        match outcome {
            Ok(()) => {
                let at = Utc::now();
                self.registry
                    .record_verification(id, VerificationRecord::success(at))
                    .await?;
                internal!(level = INFO, address_id = id, "Proxy verified");
                Ok(Verification::Verified { at })
            }
            Err(err) => {
                let reason = truncate(&err.to_string(), MAX_VERIFICATION_ERROR_CHARS);
                self.registry
                    .record_verification(id, VerificationRecord::failure(reason.clone()))
                    .await?;
                internal!(
                    level = WARN,
                    address_id = id,
                    error = %reason,
                    "Proxy verification failed"
                );
                Ok(Verification::Failed { reason })
            }
        }
    }

    async fn attempts(
        &self,
        address: &IpAddress,
        proxy: &ProxyConfig,
    ) -> Result<(), AttemptError> {
        let max_attempts = self.config.max_attempts.get();
        let mut attempt = 1;

        loop {
            match self.attempt(proxy).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= max_attempts => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        address_id = address.id,
                        attempt,
                        error = %err,
                        "Proxy verification attempt failed"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.backoff_ms)).await;
                }
            }
        }
    }

    /// One tunnel and probe, bounded by the configured timeout.
    ///
    /// The stream lives inside the timed future, so it is closed on every exit
    /// including the timeout.
    async fn attempt(&self, proxy: &ProxyConfig) -> Result<(), AttemptError> {
        let target = &self.config.target;

        let tunnel = async {
            let mut stream = socks5::connect(proxy, &target.target_addr()).await?;
            target.check(&mut stream).await?;
            Ok::<_, AttemptError>(())
        };

        tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), tunnel)
            .await
            .map_err(|_| AttemptError::Timeout(self.config.timeout_ms))?
    }
}

fn truncate(reason: &str, max_chars: usize) -> String {
    reason.chars().take(max_chars).collect()
}
