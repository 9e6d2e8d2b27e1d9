//! TOML-backed configuration for the connection engine, with per-path
//! authentication/runOnRead overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::net::IpAddr;
use std::path::Path as FsPath;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    pub paths: HashMap<String, PathConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            paths: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub read_buffer_count: usize,
    /// Advertised RTSP address handed to `runOnConnect` as `RTSP_PORT`.
    /// This crate does not itself run an RTSP server; the address names
    /// the external one `runOnConnect` commands are expected to target.
    pub rtsp_address: String,
    /// Shell command spawned once per connection, per-connection lifetime.
    pub run_on_connect: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1935".to_string(),
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            read_buffer_count: 256,
            rtsp_address: "rtsp://127.0.0.1:8554".to_string(),
            run_on_connect: None,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Extracts the port from `rtsp_address` (`scheme://host:port` or
    /// `host:port`, an optional path component ignored) for the
    /// `RTSP_PORT` environment variable `runOnConnect` receives.
    pub fn rtsp_port(&self) -> Option<u16> {
        let without_scheme = self.rtsp_address.trim().split("://").last()?;
        let host_port = without_scheme.split('/').next()?;
        host_port.rsplit(':').next()?.parse::<u16>().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { listen_addr: "127.0.0.1:9997".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Per-path configuration: authentication and a `runOnRead` shell command.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PathConfig {
    pub external_auth_url: Option<String>,
    pub allowed_ips: Vec<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub run_on_read: Option<String>,
}

impl Config {
    pub fn load(path: &FsPath) -> Result<Self, Box<dyn Error>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&raw).map_err(|e| format!("failed to parse config file: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("server.listen_addr is not a valid socket address: {}", self.server.listen_addr)
                .into());
        }
        if self.http.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(
                format!("http.listen_addr is not a valid socket address: {}", self.http.listen_addr).into()
            );
        }
        if self.server.read_timeout_secs == 0 {
            return Err("server.read_timeout_secs must be greater than zero".into());
        }
        if self.server.write_timeout_secs == 0 {
            return Err("server.write_timeout_secs must be greater than zero".into());
        }
        if self.server.read_buffer_count == 0 {
            return Err("server.read_buffer_count must be greater than zero".into());
        }
        if self.server.rtsp_port().is_none() {
            return Err(format!(
                "server.rtsp_address must include a numeric port: {}",
                self.server.rtsp_address
            )
            .into());
        }
        for (name, path_cfg) in &self.paths {
            for cidr in &path_cfg.allowed_ips {
                cidr.parse::<ipnet::IpNet>()
                    .or_else(|_| cidr.parse::<IpAddr>().map(ipnet::IpNet::from))
                    .map_err(|_| format!("paths.{name}.allowed_ips entry '{cidr}' is not a valid IP or CIDR"))?;
            }
        }
        Ok(())
    }

    /// Builds the in-memory path manager's per-path defaults from
    /// configuration, parsing CIDR/IP strings once at startup rather than on
    /// every authentication check.
    pub fn path_defaults(&self) -> HashMap<String, crate::path::PathDefaults> {
        self.paths
            .iter()
            .map(|(name, cfg)| {
                let allowed_ips = cfg
                    .allowed_ips
                    .iter()
                    .filter_map(|s| {
                        s.parse::<ipnet::IpNet>().ok().or_else(|| s.parse::<IpAddr>().ok().map(ipnet::IpNet::from))
                    })
                    .collect();
                let defaults = crate::path::PathDefaults {
                    auth: crate::auth::PathAuthConfig {
                        external_auth_url: cfg.external_auth_url.clone(),
                        allowed_ips,
                        user: cfg.user.clone(),
                        pass: cfg.pass.clone(),
                    },
                    run_on_read: cfg.run_on_read.clone(),
                };
                (name.clone(), defaults)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let mut config = Config::default();
        config.server.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut config = Config::default();
        config.server.read_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_allowed_ip() {
        let mut config = Config::default();
        config.paths.insert(
            "live/cam1".to_string(),
            PathConfig { allowed_ips: vec!["not-an-ip".to_string()], ..Default::default() },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rtsp_port_parses_scheme_and_path() {
        let mut config = Config::default();
        config.server.rtsp_address = "rtsp://127.0.0.1:8554/".to_string();
        assert_eq!(config.server.rtsp_port(), Some(8554));
    }

    #[test]
    fn rejects_rtsp_address_without_port() {
        let mut config = Config::default();
        config.server.rtsp_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn path_defaults_parses_cidrs() {
        let mut config = Config::default();
        config.paths.insert(
            "live/cam1".to_string(),
            PathConfig { allowed_ips: vec!["10.0.0.0/8".to_string()], ..Default::default() },
        );
        let defaults = config.path_defaults();
        assert_eq!(defaults["live/cam1"].auth.allowed_ips.len(), 1);
    }
}
