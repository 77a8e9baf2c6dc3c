use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Bytes we sent to a proxy or health-check target
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Bytes a proxy or health-check target sent back to us
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

const fn default_ansi() -> bool {
    true
}

/// Log output settings, read from the `logging` section of the config file
///
/// `LOG_LEVEL` in the environment takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,

    /// Colourise output
    #[serde(default = "default_ansi")]
    pub ansi: bool,

    /// Include the emitting module in each line
    #[serde(default)]
    pub targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            ansi: default_ansi(),
            targets: false,
        }
    }
}

impl LogConfig {
    /// The effective filter given an optional `LOG_LEVEL` value.
    fn filter(&self, env: Option<&str>) -> LevelFilter {
        let default = if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        env.or(self.level.as_deref()).map_or(default, |level| {
            LevelFilter::from_str(level).unwrap_or_else(|_| {
                eprintln!("Invalid log level specified {level}, defaulting to {default}");
                default
            })
        })
    }
}

/// Install the global subscriber. Only events from `egress*` targets pass.
///
/// A second call is a no-op, so every CLI command can initialise logging
/// without caring whether another path already did.
pub fn init(config: &LogConfig) {
    let level = config.filter(std::env::var("LOG_LEVEL").ok().as_deref());

    let installed = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_target(config.targets)
                .compact()
                .with_ansi(config.ansi)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("egress")
                })),
        )
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging already initialised");
    }
}
