// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the worker process. Configuration is loaded from the
//! environment once at startup and passed by value to the components.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the job/task database | `/data` |
//! | `WORKER_INDEX` | Index of this process in the fleet | `0` |
//! | `WORKER_COUNT` | Number of worker processes (shard modulus) | `1` |
//! | `LOCK_SERVER_ADDR` | Address of the fleet lock server | `127.0.0.1:7400` |
//! | `LOCK_LEASE_TIMEOUT_SECS` | Lease timeout for granted mutexes | `180` |
//! | `SUPERVISOR_TICK_MS` | Supervisor tick interval | `1000` |
//! | `RECOVERY_CADENCE_TICKS` | Ticks between job recovery scans | `30` |
//! | `TASK_TIMEOUT_CADENCE_TICKS` | Ticks between workflow timeout scans | `5` |
//! | `JOB_STALE_AFTER_SECS` | Age after which an InFlight job is reclaimable | `100800` |
//! | `RPC_URL` | EVM JSON-RPC endpoint | Required |
//! | `SIGNER_PRIVATE_KEY` | Hex private key of the relaying signer | Required |
//! | `HTTP_HOST` | Admin server bind address | `0.0.0.0` |
//! | `HTTP_PORT` | Admin server bind port | `8080` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable name for the database directory.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const WORKER_INDEX_ENV: &str = "WORKER_INDEX";
pub const WORKER_COUNT_ENV: &str = "WORKER_COUNT";
pub const LOCK_SERVER_ADDR_ENV: &str = "LOCK_SERVER_ADDR";
pub const LOCK_LEASE_TIMEOUT_ENV: &str = "LOCK_LEASE_TIMEOUT_SECS";
pub const SUPERVISOR_TICK_ENV: &str = "SUPERVISOR_TICK_MS";
pub const RECOVERY_CADENCE_ENV: &str = "RECOVERY_CADENCE_TICKS";
pub const TASK_TIMEOUT_CADENCE_ENV: &str = "TASK_TIMEOUT_CADENCE_TICKS";
pub const JOB_STALE_AFTER_ENV: &str = "JOB_STALE_AFTER_SECS";
pub const RPC_URL_ENV: &str = "RPC_URL";
pub const SIGNER_PRIVATE_KEY_ENV: &str = "SIGNER_PRIVATE_KEY";
pub const HTTP_HOST_ENV: &str = "HTTP_HOST";
pub const HTTP_PORT_ENV: &str = "HTTP_PORT";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Default lease timeout for the fleet mutex service.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(180);

/// Default age after which an InFlight job without progress is considered
/// abandoned. Roughly 28 hours.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(28 * 60 * 60);

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Invalid {
                var: LOG_FORMAT_ENV,
                reason: format!("unknown log format `{other}`"),
            }),
        }
    }
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub worker_index: u64,
    pub worker_count: u64,
    pub lock_server_addr: String,
    pub lease_timeout: Duration,
    pub tick_interval: Duration,
    pub recovery_cadence: u64,
    pub task_timeout_cadence: u64,
    pub stale_after: Duration,
    pub rpc_url: Option<String>,
    pub signer_private_key: Option<String>,
    pub http_host: String,
    pub http_port: u16,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            worker_index: 0,
            worker_count: 1,
            lock_server_addr: "127.0.0.1:7400".to_string(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            tick_interval: Duration::from_millis(1000),
            recovery_cadence: 30,
            task_timeout_cadence: 5,
            stale_after: DEFAULT_STALE_AFTER,
            rpc_url: None,
            signer_private_key: None,
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unset variables fall back to [`Config::default`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            data_dir: lookup(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            worker_index: parse_or(&lookup, WORKER_INDEX_ENV, defaults.worker_index)?,
            worker_count: parse_or(&lookup, WORKER_COUNT_ENV, defaults.worker_count)?,
            lock_server_addr: lookup(LOCK_SERVER_ADDR_ENV).unwrap_or(defaults.lock_server_addr),
            lease_timeout: parse_or(&lookup, LOCK_LEASE_TIMEOUT_ENV, 180u64)
                .map(Duration::from_secs)?,
            tick_interval: parse_or(&lookup, SUPERVISOR_TICK_ENV, 1000u64)
                .map(Duration::from_millis)?,
            recovery_cadence: parse_or(&lookup, RECOVERY_CADENCE_ENV, defaults.recovery_cadence)?,
            task_timeout_cadence: parse_or(
                &lookup,
                TASK_TIMEOUT_CADENCE_ENV,
                defaults.task_timeout_cadence,
            )?,
            stale_after: parse_or(&lookup, JOB_STALE_AFTER_ENV, DEFAULT_STALE_AFTER.as_secs())
                .map(Duration::from_secs)?,
            rpc_url: lookup(RPC_URL_ENV),
            signer_private_key: lookup(SIGNER_PRIVATE_KEY_ENV),
            http_host: lookup(HTTP_HOST_ENV).unwrap_or(defaults.http_host),
            http_port: parse_or(&lookup, HTTP_PORT_ENV, defaults.http_port)?,
            log_format: match lookup(LOG_FORMAT_ENV) {
                Some(raw) => raw.parse()?,
                None => defaults.log_format,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid {
                var: WORKER_COUNT_ENV,
                reason: "fleet must have at least one worker".to_string(),
            });
        }
        if self.worker_index >= self.worker_count {
            return Err(ConfigError::Invalid {
                var: WORKER_INDEX_ENV,
                reason: format!(
                    "index {} out of range for {} workers",
                    self.worker_index, self.worker_count
                ),
            });
        }
        for (var, cadence) in [
            (RECOVERY_CADENCE_ENV, self.recovery_cadence),
            (TASK_TIMEOUT_CADENCE_ENV, self.task_timeout_cadence),
        ] {
            if cadence == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    reason: "cadence must be at least one tick".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether this process hosts the fleet lock server.
    pub fn hosts_lock_server(&self) -> bool {
        self.worker_index == 0
    }

    /// Path of the redb database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("relay.redb")
    }

    /// Read a required value, failing with a descriptive error when unset.
    pub fn require<'a>(value: &'a Option<String>, var: &'static str) -> Result<&'a str, ConfigError> {
        value.as_deref().ok_or(ConfigError::Missing(var))
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.worker_index, 0);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.lease_timeout, Duration::from_secs(180));
        assert_eq!(config.stale_after, Duration::from_secs(100_800));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.hosts_lock_server());
    }

    #[test]
    fn parses_fleet_settings() {
        let config = Config::from_lookup(lookup_from(&[
            (WORKER_INDEX_ENV, "2"),
            (WORKER_COUNT_ENV, "3"),
            (JOB_STALE_AFTER_ENV, "60"),
            (LOG_FORMAT_ENV, "JSON"),
        ]))
        .unwrap();
        assert_eq!(config.worker_index, 2);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(!config.hosts_lock_server());
    }

    #[test]
    fn rejects_index_outside_fleet() {
        let err = Config::from_lookup(lookup_from(&[
            (WORKER_INDEX_ENV, "2"),
            (WORKER_COUNT_ENV, "2"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == WORKER_INDEX_ENV));
    }

    #[test]
    fn zero_cadence_names_the_offending_variable() {
        let err = Config::from_lookup(lookup_from(&[(TASK_TIMEOUT_CADENCE_ENV, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == TASK_TIMEOUT_CADENCE_ENV));

        let err = Config::from_lookup(lookup_from(&[(RECOVERY_CADENCE_ENV, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == RECOVERY_CADENCE_ENV));
    }

    #[test]
    fn rejects_unparseable_numbers() {
        let err = Config::from_lookup(lookup_from(&[(HTTP_PORT_ENV, "eighty")])).unwrap_err();
        assert!(err.to_string().contains(HTTP_PORT_ENV));
    }

    #[test]
    fn require_reports_missing_variable() {
        let config = Config::default();
        let err = Config::require(&config.rpc_url, RPC_URL_ENV).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(RPC_URL_ENV)));
    }
}
