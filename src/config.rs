//! Configuration management for Sluice.
//!
//! Configuration is layered: built-in defaults, then an optional file (YAML,
//! TOML or JSON, picked by extension), then `SLUICE__`-prefixed environment
//! variables such as `SLUICE__SERVER__GRPC_ADDR`. Command-line flags are
//! applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SluiceError};
use crate::ratelimit::{BucketOptions, LimiterOptions};

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            log_level: default_log_level(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Snapshot file holding bucket state; `None` keeps state in memory only
    #[serde(default = "default_store_path")]
    pub path: Option<PathBuf>,

    /// How often the snapshot is flushed, in milliseconds. Commits made
    /// since the last flush are lost on a crash.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// The snapshot flush period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_store_path() -> Option<PathBuf> {
    Some(PathBuf::from("./sluice-data/state.json"))
}

fn default_flush_interval_ms() -> u64 {
    1000
}

/// Limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum number of cached buckets, 0 for unbounded
    #[serde(default)]
    pub cache_capacity: usize,

    /// Delete a bucket's backlog when it is evicted or shut down
    #[serde(default)]
    pub purge_on_stop: bool,
}

impl LimiterConfig {
    /// Build limiter options, logging decay failures through `tracing`.
    pub fn options(&self) -> LimiterOptions {
        LimiterOptions {
            capacity: NonZeroUsize::new(self.cache_capacity),
            bucket: BucketOptions {
                purge_on_stop: self.purge_on_stop,
                ..Default::default()
            },
        }
    }
}

impl SluiceConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("SLUICE")
                .separator("__")
                .try_parsing(true),
        );

        let config: SluiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the type system does not rule out.
    pub fn validate(&self) -> Result<()> {
        if self.store.flush_interval_ms == 0 {
            return Err(SluiceError::Config(
                "store.flush_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
