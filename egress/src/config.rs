use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use egress_common::{Liveness, LogConfig};
use egress_proxy::{ProxyVerifier, VerifierConfig};
use egress_queue::{
    AddressLister, QueueWorker, StaticAddressLister, SystemAddressLister, WorkerConfig,
};
use egress_store::{StoreConfig, StoreConfigError, Stores};
use serde::Deserialize;
use thiserror::Error;

use crate::processor::ProcessorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("{CONFIG_ENV} points to non-existent file: {}", .0.display())]
    MissingFromEnv(PathBuf),

    #[error("No configuration file found. Tried {CONFIG_ENV} and {}", display_paths(.0))]
    NotFound(Vec<PathBuf>),
}

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "EGRESS_CONFIG";

/// Searched in order when neither `--config` nor [`CONFIG_ENV`] is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./egress.ron", "/etc/egress/egress.ron"];

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pick the configuration file for a CLI invocation.
///
/// An explicit path wins and is returned unchecked so the read error names
/// it. Otherwise `from_env` (the value of [`CONFIG_ENV`]) must exist, and
/// failing that the first existing entry of `defaults` is used.
///
/// # Errors
///
/// Fails if `from_env` names a missing file, or no default exists.
pub fn locate_config(
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    if let Some(path) = from_env {
        return if path.exists() {
            Ok(path)
        } else {
            Err(ConfigError::MissingFromEnv(path))
        };
    }

    defaults
        .iter()
        .find(|path| path.exists())
        .cloned()
        .ok_or_else(|| ConfigError::NotFound(defaults.to_vec()))
}

/// Top-level configuration file
///
/// # Examples
///
/// ```ron
/// Egress (
///     store: Postgres(url: "postgres://egress@db/egress", max_connections: 16),
///     worker: (worker_name: "mx1", batch_size: 10, poll_interval_secs: 5),
///     verifier: (
///         target: (host: "ifconfig.me", port: 80, probe: Http(path: "/")),
///         timeout_ms: 10000,
///     ),
///     processor: Command(program: "/usr/local/bin/deliver"),
///     logging: (level: Some("info"), ansi: false),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Egress {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub verifier: VerifierConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub logging: LogConfig,

    /// Addresses to treat as this host's interfaces instead of enumerating
    /// the real ones
    #[serde(default)]
    pub host_addresses: Option<Vec<IpAddr>>,
}

impl Egress {
    /// Parse a RON configuration document.
    ///
    /// # Errors
    ///
    /// Fails if the document is not valid RON for this structure.
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(content)?)
    }

    /// Read and parse the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&content)
    }

    /// Build the configured stores without connecting to them.
    ///
    /// # Errors
    ///
    /// Fails if the store configuration is invalid.
    pub fn stores(&self) -> Result<Stores, StoreConfigError> {
        self.store.build()
    }

    #[must_use]
    pub fn lister(&self) -> Arc<dyn AddressLister> {
        match &self.host_addresses {
            Some(addresses) => Arc::new(StaticAddressLister(addresses.clone())),
            None => Arc::new(SystemAddressLister),
        }
    }

    #[must_use]
    pub fn worker(&self, stores: &Stores, liveness: Liveness) -> QueueWorker {
        QueueWorker::new(
            &self.worker,
            Arc::clone(&stores.registry),
            Arc::clone(&stores.queue),
            self.lister(),
            self.processor.build(),
            liveness,
        )
    }

    #[must_use]
    pub fn verifier(&self, stores: &Stores) -> ProxyVerifier {
        ProxyVerifier::new(Arc::clone(&stores.registry), self.verifier.clone())
    }
}
