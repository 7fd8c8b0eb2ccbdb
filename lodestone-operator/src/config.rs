//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for the Prometheus metrics endpoint.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The Kubernetes namespace in which this operator runs.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds
    /// the application config from that. In the future, this may take into
    /// account an optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_metrics_port() -> u16 {
        7002
    }
}
