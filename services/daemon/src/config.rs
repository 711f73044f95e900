//! Configuration for the fleet daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_retry::{RetryPolicy, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};

use crate::pool::{RenderPool, DEFAULT_RENDER_WORKERS};
use crate::remote::DEFAULT_REMOTE_TIMEOUT;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Name of this node in the cluster.
    pub node_name: String,

    /// PEM certificate shared by the cluster members.
    pub cluster_cert_path: Option<PathBuf>,

    /// PEM private key matching the cluster certificate.
    pub cluster_key_path: Option<PathBuf>,

    /// JSON file the in-memory cluster is seeded from.
    pub seed_file: Option<PathBuf>,

    pub listing: ListingConfig,
}

/// Tunables of the listing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingConfig {
    /// Upper bound on concurrent local renders.
    pub render_workers: usize,

    /// Time allowed for a remote node to answer.
    pub remote_timeout: Duration,

    pub retry_max_attempts: u32,

    pub retry_backoff: Duration,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            render_workers: DEFAULT_RENDER_WORKERS,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_BACKOFF,
        }
    }
}

impl ListingConfig {
    pub fn render_pool(&self) -> RenderPool {
        RenderPool::new(self.render_workers)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_backoff)
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8443".to_string())
            .parse()
            .context("invalid FLEET_LISTEN_ADDR")?;

        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let node_name = lookup("FLEET_NODE_NAME").unwrap_or_else(|| "local".to_string());

        let cluster_cert_path = lookup("FLEET_CLUSTER_CERT").map(PathBuf::from);
        let cluster_key_path = lookup("FLEET_CLUSTER_KEY").map(PathBuf::from);
        let seed_file = lookup("FLEET_SEED_FILE").map(PathBuf::from);

        let defaults = ListingConfig::default();
        let listing = ListingConfig {
            render_workers: lookup("FLEET_RENDER_WORKERS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.render_workers),
            remote_timeout: lookup("FLEET_REMOTE_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.remote_timeout),
            retry_max_attempts: lookup("FLEET_RETRY_MAX_ATTEMPTS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_max_attempts),
            retry_backoff: lookup("FLEET_RETRY_BACKOFF_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
        };

        Ok(Self {
            listen_addr,
            log_level,
            node_name,
            cluster_cert_path,
            cluster_key_path,
            seed_file,
            listing,
        })
    }
}
