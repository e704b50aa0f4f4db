// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for conpaas-manager.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Bounded retry for cloud volume calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Manager configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the RPC server listens on
    pub bind_addr: SocketAddr,
    /// Port agents listen on
    pub agent_port: u16,
    /// Director callback endpoint used for cloud and credit requests
    pub director_url: String,
    /// First device name tried when attaching a volume
    pub dev_target: String,
    /// Retry policy for attach, detach and destroy
    pub volume_retry: RetryPolicy,
    /// Size in MB of the data volume of each MySQL node
    pub mysql_volume_size: u64,
    /// Size in MB of the volume of each XtreemFS OSD
    pub osd_volume_size: u64,
    /// Directory storing uploaded code versions
    pub code_repo: PathBuf,
    /// Cloud names nodes may be placed in
    pub clouds: Vec<String>,
    /// Timeout for outbound RPC calls
    pub rpc_timeout: Duration,
    /// Service types created when the manager boots
    pub initial_services: Vec<String>,
    /// File the manager log is also written to, served by `get_manager_log`
    pub log_file: Option<PathBuf>,
    /// Directory holding per-service startup scripts
    pub home_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            agent_port: 5555,
            director_url: "http://127.0.0.1:5000".to_string(),
            dev_target: "/dev/sdb".to_string(),
            volume_retry: RetryPolicy::default(),
            mysql_volume_size: 1024,
            osd_volume_size: 1024,
            code_repo: PathBuf::from(".data/code"),
            clouds: vec!["default".to_string()],
            rpc_timeout: Duration::from_secs(30),
            initial_services: Vec::new(),
            log_file: None,
            home_dir: PathBuf::from(".data/home"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port: u16 = lookup("CONPAAS_MANAGER_PORT")
            .unwrap_or_else(|| "8443".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort("CONPAAS_MANAGER_PORT"))?;
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let agent_port: u16 = lookup("CONPAAS_AGENT_PORT")
            .unwrap_or_else(|| "5555".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort("CONPAAS_AGENT_PORT"))?;

        let director_url = lookup("CONPAAS_DIRECTOR_URL")
            .ok_or(ConfigError::MissingEnvVar("CONPAAS_DIRECTOR_URL"))?;

        let dev_target = lookup("CONPAAS_DEV_TARGET").unwrap_or(defaults.dev_target);
        if dev_target.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "CONPAAS_DEV_TARGET",
                value: dev_target,
            });
        }

        let volume_retry = RetryPolicy {
            attempts: parse_number(&lookup, "CONPAAS_VOLUME_RETRY_ATTEMPTS", 10)?.max(1) as u32,
            backoff: Duration::from_secs(parse_number(
                &lookup,
                "CONPAAS_VOLUME_RETRY_BACKOFF_SECS",
                10,
            )?),
        };

        let mysql_volume_size = parse_number(&lookup, "CONPAAS_MYSQL_VOLUME_SIZE", 1024)?;
        let osd_volume_size = parse_number(&lookup, "CONPAAS_OSD_VOLUME_SIZE", 1024)?;

        let code_repo = lookup("CONPAAS_CODE_REPO")
            .map(PathBuf::from)
            .unwrap_or(defaults.code_repo);

        let clouds = lookup("CONPAAS_CLOUDS")
            .map(|v| split_list(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.clouds);

        let rpc_timeout =
            Duration::from_secs(parse_number(&lookup, "CONPAAS_RPC_TIMEOUT_SECS", 30)?);

        let initial_services = lookup("CONPAAS_INITIAL_SERVICES")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let log_file = lookup("CONPAAS_LOG_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let home_dir = lookup("CONPAAS_HOME")
            .map(PathBuf::from)
            .unwrap_or(defaults.home_dir);

        Ok(Self {
            bind_addr,
            agent_port,
            director_url,
            dev_target,
            volume_retry,
            mysql_volume_size,
            osd_volume_size,
            code_repo,
            clouds,
            rpc_timeout,
            initial_services,
            log_file,
            home_dir,
        })
    }

    /// Override the volume retry policy.
    pub fn with_volume_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.volume_retry = RetryPolicy { attempts, backoff };
        self
    }

    /// Write the manager log to `path` as well.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Override the directory holding startup scripts.
    pub fn with_home_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.home_dir = path.into();
        self
    }

    /// Override the code repository directory.
    pub fn with_code_repo(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_repo = path.into();
        self
    }

    /// Override the list of known clouds.
    pub fn with_clouds<I, S>(mut self, clouds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clouds = clouds.into_iter().map(Into::into).collect();
        self
    }
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number in {0}")]
    InvalidPort(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_only_director() {
        let config =
            Config::from_lookup(lookup(&[("CONPAAS_DIRECTOR_URL", "https://director:5555")]))
                .unwrap();

        assert_eq!(config.bind_addr.port(), 8443);
        assert_eq!(config.agent_port, 5555);
        assert_eq!(config.dev_target, "/dev/sdb");
        assert_eq!(config.volume_retry, RetryPolicy::default());
        assert_eq!(config.clouds, vec!["default"]);
        assert!(config.initial_services.is_empty());
        assert!(config.log_file.is_none());
        assert_eq!(config.home_dir, PathBuf::from(".data/home"));
    }

    #[test]
    fn test_missing_director_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("CONPAAS_DIRECTOR_URL")));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CONPAAS_DIRECTOR_URL", "http://d"),
            ("CONPAAS_MANAGER_PORT", "9000"),
            ("CONPAAS_VOLUME_RETRY_ATTEMPTS", "3"),
            ("CONPAAS_VOLUME_RETRY_BACKOFF_SECS", "0"),
            ("CONPAAS_CLOUDS", "default, ec2 ,"),
            ("CONPAAS_INITIAL_SERVICES", "mysql,generic"),
            ("CONPAAS_LOG_FILE", "/var/log/conpaas/manager.log"),
            ("CONPAAS_HOME", "/etc/conpaas"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.volume_retry.attempts, 3);
        assert_eq!(config.volume_retry.backoff, Duration::ZERO);
        assert_eq!(config.clouds, vec!["default", "ec2"]);
        assert_eq!(config.initial_services, vec!["mysql", "generic"]);
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/conpaas/manager.log")));
        assert_eq!(config.home_dir, PathBuf::from("/etc/conpaas"));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[
            ("CONPAAS_DIRECTOR_URL", "http://d"),
            ("CONPAAS_AGENT_PORT", "99999"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort("CONPAAS_AGENT_PORT")));

        let err = Config::from_lookup(lookup(&[
            ("CONPAAS_DIRECTOR_URL", "http://d"),
            ("CONPAAS_OSD_VOLUME_SIZE", "big"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
