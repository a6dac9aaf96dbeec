use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_ERROR_REQUEUE_SECS: u64 = 3;
const DEFAULT_PERMANENT_REQUEUE_SECS: u64 = 60;

/// Controller configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Only watch Reports and Deployments in this namespace; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Backoff after an error that may go away on its own
    pub error_requeue: Duration,
    /// Backoff after an ownership error that needs outside intervention
    pub permanent_requeue: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());
        let error_requeue = seconds(&lookup, "ERROR_REQUEUE_SECS", DEFAULT_ERROR_REQUEUE_SECS)?;
        let permanent_requeue = seconds(
            &lookup,
            "PERMANENT_ERROR_REQUEUE_SECS",
            DEFAULT_PERMANENT_REQUEUE_SECS,
        )?;

        Ok(Config {
            watch_namespace,
            error_requeue,
            permanent_requeue,
        })
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let secs = match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a whole number of seconds, got {:?}", key, raw))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}
