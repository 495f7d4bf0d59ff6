// src/config.rs

//! Manages this instance's own bootstrap configuration: loading, defaults,
//! and validation. Distinct from the clusterwide configuration *document*
//! (`core::document::Doc`), which is the payload the applier manages.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3301
}

fn default_workdir() -> String {
    ".".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Intermediate struct mirroring what's actually on disk; every field has a
/// default so a mostly-empty `config.toml` is valid.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_workdir")]
    workdir: String,
    uuid: Option<String>,
    #[serde(default)]
    bootstrap_peers: Vec<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            host: default_host(),
            port: default_port(),
            workdir: default_workdir(),
            uuid: None,
            bootstrap_peers: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// This instance's bootstrap configuration (`config.toml`), read once at
/// startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workdir: String,
    pub uuid: String,
    pub bootstrap_peers: Vec<String>,
    pub log_level: String,
}

impl Config {
    /// Loads and validates the instance config from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig =
            toml::from_str(&raw_str).with_context(|| format!("failed to parse '{path}' as TOML"))?;
        let config = Self::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let uuid = match raw.uuid {
            Some(u) => u,
            None => uuid::Uuid::new_v4().to_string(),
        };
        Ok(Config {
            host: raw.host,
            port: raw.port,
            workdir: raw.workdir,
            uuid,
            bootstrap_peers: raw.bootstrap_peers,
            log_level: raw.log_level,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("'host' must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("'port' must be nonzero"));
        }
        if uuid::Uuid::parse_str(&self.uuid).is_err() {
            return Err(anyhow!("'uuid' must be a valid UUID, got '{}'", self.uuid));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawConfig::default()).expect("default raw config is always valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_port() {
        let mut c = Config::default();
        c.port = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_malformed_uuid() {
        let mut c = Config::default();
        c.uuid = "not-a-uuid".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn from_file_loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "host = \"0.0.0.0\"\nport = 4000\nworkdir = \"/tmp/x\"\nuuid = \"00000000-0000-0000-0000-000000000001\"\n",
        )
        .unwrap();
        let cfg = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.host, "0.0.0.0");
    }
}
