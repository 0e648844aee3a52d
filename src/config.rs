use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub op_timeout: Duration,
    pub op_retries: u32,
    pub retry_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Optional values that fail to parse fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL not set")?;
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Ok(Self {
            database_url,
            port: lookup("PORT").and_then(|s| s.parse().ok()).unwrap_or(8081),
            db_max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            op_timeout: Duration::from_millis(parsed("OP_TIMEOUT_MS").unwrap_or(5000)),
            op_retries: lookup("OP_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(2),
            retry_backoff: Duration::from_millis(parsed("RETRY_BACKOFF_MS").unwrap_or(50)),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.op_timeout,
            retries: self.op_retries,
            backoff: self.retry_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/lms")])).unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.db_max_connections, 10);
        assert_eq!(cfg.op_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.op_retries, 2);
        assert_eq!(cfg.retry_backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let cfg = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/lms"),
            ("PORT", "9000"),
            ("OP_TIMEOUT_MS", "250"),
            ("OP_RETRIES", "not-a-number"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.op_timeout, Duration::from_millis(250));
        assert_eq!(cfg.op_retries, 2);

        let policy = cfg.retry_policy();
        assert_eq!(policy.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_database_url_is_required() {
        let err = Config::from_lookup(lookup(&[("PORT", "9000")])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
