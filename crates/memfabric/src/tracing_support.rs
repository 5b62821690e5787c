//! Structured logging setup for fabric nodes.
//!
//! The crate itself only emits `tracing` events: `debug` for protocol steps,
//! `info` for node lifecycle, `warn` for dropped messages and `error` right
//! before a fatal fault aborts the process. This module installs a
//! subscriber for binaries, demos and benchmarks.
//!
//! # Example
//!
//! ```ignore
//! use memfabric::tracing_support::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::default())?;
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directive (default `memfabric=info,warn`)
//! - `MEMFABRIC_LOG_FORMAT`: `pretty`, `json` or `compact` (default `pretty`)

use anyhow::Result;
#[cfg(feature = "subscriber")]
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Pretty-printed human-readable format
    Pretty,
    /// JSON format for log shipping
    Json,
    /// Single line per event
    Compact,
}

impl TracingFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => TracingFormat::Json,
            "compact" => TracingFormat::Compact,
            _ => TracingFormat::Pretty,
        }
    }
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub format: TracingFormat,
    /// Filter directive (e.g. "memfabric=debug")
    pub filter: String,
    pub with_ansi: bool,
    pub with_target: bool,
    /// Show thread names; useful to tell the listener from faulting threads
    pub with_thread_names: bool,
    pub with_line_number: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        let format = std::env::var("MEMFABRIC_LOG_FORMAT")
            .map(|s| TracingFormat::parse(&s))
            .unwrap_or(TracingFormat::Pretty);
        let filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "memfabric=info,warn".to_string());

        Self {
            format,
            filter,
            with_ansi: true,
            with_target: true,
            with_thread_names: true,
            with_line_number: false,
        }
    }
}

/// Install a global subscriber. Fails if one is already installed.
#[cfg(feature = "subscriber")]
pub fn init_tracing(config: TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)?;
    tracing_subscriber::registry()
        .with(format_layer(&config).with_filter(filter))
        .try_init()?;
    Ok(())
}

#[cfg(feature = "subscriber")]
fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer()
        .with_target(config.with_target)
        .with_thread_names(config.with_thread_names)
        .with_line_number(config.with_line_number);
    match config.format {
        TracingFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        TracingFormat::Json => layer.json().boxed(),
        TracingFormat::Compact => layer.compact().with_ansi(config.with_ansi).boxed(),
    }
}

/// Without the `subscriber` feature there is nothing to install.
#[cfg(not(feature = "subscriber"))]
pub fn init_tracing(_config: TracingConfig) -> Result<()> {
    Ok(())
}

/// Record the outcome of a completed migration.
pub fn record_migration(addr: crate::RegionAddress, bytes: usize, pages_pulled: usize, elapsed_us: u64) {
    tracing::info!(
        %addr,
        bytes,
        pages_pulled,
        elapsed_us,
        mb_per_s = if elapsed_us == 0 {
            0.0
        } else {
            bytes as f64 / elapsed_us as f64
        },
        "migration complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_format_parse() {
        assert_eq!(TracingFormat::parse("json"), TracingFormat::Json);
        assert_eq!(TracingFormat::parse("COMPACT"), TracingFormat::Compact);
        assert_eq!(TracingFormat::parse("other"), TracingFormat::Pretty);
    }

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert!(config.with_target);
        assert!(!config.filter.is_empty());
    }

    #[cfg(feature = "subscriber")]
    #[test]
    fn test_every_format_builds_a_layer() {
        for format in [TracingFormat::Pretty, TracingFormat::Json, TracingFormat::Compact] {
            let config = TracingConfig {
                format,
                ..TracingConfig::default()
            };
            let _layer = format_layer(&config);
        }
    }

    #[test]
    fn test_record_migration_does_not_panic() {
        record_migration(crate::RegionAddress(0x1000), 4096, 8, 0);
        record_migration(crate::RegionAddress(0x1000), 4096, 8, 120);
    }
}
