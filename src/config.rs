use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::timer::Percentile;

/// Top-level configuration for the statsdaemon process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP address metrics are received on. Default: "0.0.0.0:8125".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// TCP address the admin protocol is served on. Default: "0.0.0.0:8126".
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// TCP address of the downstream Carbon-compatible sink.
    /// Default: "127.0.0.1:2003".
    #[serde(default = "default_graphite_addr")]
    pub graphite_addr: String,

    /// How often aggregates are flushed to the sink. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Prefix for counter rate lines. Default: "stats.".
    #[serde(default = "default_prefix_rates")]
    pub prefix_rates: String,

    /// Prefix for timer lines. Default: "stats.timers.".
    #[serde(default = "default_prefix_timers")]
    pub prefix_timers: String,

    /// Prefix for gauge lines. Default: "stats.gauges.".
    #[serde(default = "default_prefix_gauges")]
    pub prefix_gauges: String,

    /// Comma-separated signed percentile thresholds (e.g. "90,99.9,-75").
    /// Empty means no thresholds.
    #[serde(default)]
    pub percentile_thresholds: String,

    /// Target source-side timer submission rate used for adaptive
    /// sample-rate advice. Default: 1000.
    #[serde(default = "default_max_timers_per_s")]
    pub max_timers_per_s: u64,
}

// --- Default value functions ---

fn default_listen_addr() -> String {
    "0.0.0.0:8125".to_string()
}

fn default_admin_addr() -> String {
    "0.0.0.0:8126".to_string()
}

fn default_graphite_addr() -> String {
    "127.0.0.1:2003".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_prefix_rates() -> String {
    "stats.".to_string()
}

fn default_prefix_timers() -> String {
    "stats.timers.".to_string()
}

fn default_prefix_gauges() -> String {
    "stats.gauges.".to_string()
}

fn default_max_timers_per_s() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            graphite_addr: default_graphite_addr(),
            flush_interval: default_flush_interval(),
            prefix_rates: default_prefix_rates(),
            prefix_timers: default_prefix_timers(),
            prefix_gauges: default_prefix_gauges(),
            percentile_thresholds: String::new(),
            max_timers_per_s: default_max_timers_per_s(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            bail!("listen_addr is required");
        }

        if self.admin_addr.is_empty() {
            bail!("admin_addr is required");
        }

        if self.graphite_addr.is_empty() {
            bail!("graphite_addr is required");
        }

        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }

        if self.max_timers_per_s == 0 {
            bail!("max_timers_per_s must be positive");
        }

        self.percentiles()
            .context("parsing percentile_thresholds")?;

        Ok(())
    }

    /// Parse the configured percentile thresholds. Fatal at startup only.
    pub fn percentiles(&self) -> Result<Vec<Percentile>> {
        Percentile::parse_list(&self.percentile_thresholds)
    }
}
