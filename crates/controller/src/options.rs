//! Controller configuration: serde defaults, YAML files and `RECON_*` env overrides.

use std::path::Path;
use std::time::Duration;

use recon_queue::RateLimiterConfig;
use serde::{Deserialize, Serialize};

use crate::ControllerError;

/// Retries before a failing key is dropped and reported.
pub const DEFAULT_MAX_REQUEUES: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerOptions {
    /// Used as queue name, log field and metric label.
    pub name: String,
    pub max_requeues: u32,
    /// Seconds between full redeliveries of the cache; absent or 0 disables resync.
    #[serde(with = "opt_secs")]
    pub resync_period: Option<Duration>,
    pub workers: usize,
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            name: "controller".into(),
            max_requeues: DEFAULT_MAX_REQUEUES,
            resync_period: None,
            workers: 2,
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl ControllerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_requeues(mut self, max: u32) -> Self {
        self.max_requeues = max;
        self
    }

    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync_period = Some(period).filter(|p| !p.is_zero());
        self
    }

    /// Apply `RECON_WORKERS`, `RECON_MAX_REQUEUES`, `RECON_RESYNC_SECS` and the
    /// rate limiter variables.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("RECON_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_parse("RECON_MAX_REQUEUES") {
            self.max_requeues = v;
        }
        if let Some(v) = env_parse::<u64>("RECON_RESYNC_SECS") {
            self.resync_period = Some(Duration::from_secs(v)).filter(|p| !p.is_zero());
        }
        self.rate_limiter = self.rate_limiter.with_env_overrides();
        self
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, ControllerError> {
        serde_yaml::from_str(s).map_err(|e| ControllerError::Config(e.to_string()))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ControllerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.filter(|s| *s > 0).map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let opts = ControllerOptions::from_yaml_str(
            "name: apibinding\nresync_period: 30\nrate_limiter:\n  qps: 50.0\n",
        )
        .unwrap();
        assert_eq!(opts.name, "apibinding");
        assert_eq!(opts.resync_period, Some(Duration::from_secs(30)));
        assert_eq!(opts.max_requeues, DEFAULT_MAX_REQUEUES);
        assert_eq!(opts.rate_limiter.qps, 50.0);
        assert_eq!(opts.rate_limiter.burst, 100);
    }

    #[test]
    fn zero_resync_disables_it() {
        let opts = ControllerOptions::from_yaml_str("resync_period: 0").unwrap();
        assert_eq!(opts.resync_period, None);
        assert_eq!(ControllerOptions::new("x").with_resync(Duration::ZERO).resync_period, None);
    }

    #[test]
    fn bad_yaml_is_a_config_error() {
        let err = ControllerOptions::from_yaml_str("workers: many").unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)));
    }
}
