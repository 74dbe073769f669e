// src/config.rs
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ServerError, ServerResult};

/// Which server implementation handles connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Thread-per-connection; serializes requests per connection.
    Blocking,
    /// Readiness-driven event loop with a worker pool.
    Multiplexing,
}

impl Default for ServerKind {
    fn default() -> Self {
        ServerKind::Multiplexing
    }
}

impl FromStr for ServerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(ServerKind::Blocking),
            "multiplexing" => Ok(ServerKind::Multiplexing),
            other => Err(format!("unknown server type '{}'", other)),
        }
    }
}

/// Server configuration, immutable after start.
///
/// Loadable from a YAML file; every field has a default so a partial file
/// (or none at all) is valid. CLI flags override file values.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub server_type: ServerKind,
    #[serde(default = "default_buffer_cap")]
    pub max_read_buffer_bytes: usize,
    #[serde(default = "default_buffer_cap")]
    pub max_write_buffer_bytes: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_epoll_max_events")]
    pub epoll_max_events: usize,
    /// 0 means "pick from the machine": max(8, 4 * cpus).
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_true")]
    pub toggle_write_interest: bool,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_buffer_cap() -> usize {
    65_536
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_epoll_max_events() -> usize {
    512
}

fn default_accept_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_pool_capacity() -> usize {
    100
}

fn default_reap_interval() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_type: ServerKind::default(),
            max_read_buffer_bytes: default_buffer_cap(),
            max_write_buffer_bytes: default_buffer_cap(),
            idle_timeout_secs: default_idle_timeout(),
            epoll_max_events: default_epoll_max_events(),
            worker_threads: 0,
            accept_backlog: default_accept_backlog(),
            max_connections: default_max_connections(),
            toggle_write_interest: default_true(),
            pool_capacity: default_pool_capacity(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&text)
            .map_err(|e| ServerError::Config(format!("could not parse {}: {}", path.display(), e)))
    }

    /// The listen address as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the worker pool size; 0 defers to the machine.
    pub fn resolved_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::cmp::max(8, 4 * num_cpus::get())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.server_type, ServerKind::Multiplexing);
        assert_eq!(cfg.max_read_buffer_bytes, 65_536);
        assert_eq!(cfg.max_write_buffer_bytes, 65_536);
        assert_eq!(cfg.idle_timeout_secs, 60);
        assert_eq!(cfg.epoll_max_events, 512);
        assert_eq!(cfg.accept_backlog, 1024);
        assert_eq!(cfg.max_connections, 10_000);
        assert!(cfg.toggle_write_interest);
        assert_eq!(cfg.pool_capacity, 100);
        assert!(cfg.resolved_workers() >= 8);
    }

    #[test]
    fn test_partial_yaml() {
        let cfg: Config =
            serde_yaml::from_str("host: 127.0.0.1\nport: 9000\nserver_type: blocking\n").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.server_type, ServerKind::Blocking);
        // Untouched fields keep their defaults
        assert_eq!(cfg.max_connections, 10_000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let res: Result<Config, _> = serde_yaml::from_str("bogus_key: 1\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_server_kind_from_str() {
        assert_eq!(
            ServerKind::from_str("Multiplexing").unwrap(),
            ServerKind::Multiplexing
        );
        assert_eq!(ServerKind::from_str("blocking").unwrap(), ServerKind::Blocking);
        assert!(ServerKind::from_str("udp").is_err());
    }

    #[test]
    fn test_explicit_workers_win() {
        let cfg = Config {
            worker_threads: 3,
            ..Config::default()
        };
        assert_eq!(cfg.resolved_workers(), 3);
    }
}
