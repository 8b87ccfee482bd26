//! Node configuration: TOML file, environment overrides, CLI overrides, in
//! ascending precedence.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Identifier reported by /health.
    pub node_id: String,
    /// Coordinator API listen address.
    pub rpc_addr: String,
    /// Blob server listen address. Its port must match `file_port`, which is
    /// also what orchestrated transfers dial on source peers.
    pub file_addr: String,
    pub file_port: u16,
    /// Root directory for sled and the blob vault.
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_format: String,
    /// Upper bound in seconds on one orchestrated fetch.
    pub fetch_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: "tracker-node".to_string(),
            rpc_addr: "0.0.0.0:8080".to_string(),
            file_addr: "0.0.0.0:9000".to_string(),
            file_port: 9000,
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            fetch_timeout_secs: 30,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("TRACKER_NODE_ID") {
            self.node_id = value;
        }
        if let Ok(value) = std::env::var("TRACKER_RPC_ADDR") {
            self.rpc_addr = value;
        }
        if let Ok(value) = std::env::var("TRACKER_FILE_ADDR") {
            self.file_addr = value;
        }
        if let Ok(value) = std::env::var("TRACKER_FILE_PORT") {
            if let Ok(port) = value.parse() {
                self.file_port = port;
            }
        }
        if let Ok(value) = std::env::var("TRACKER_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("TRACKER_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Ok(value) = std::env::var("TRACKER_LOG_FORMAT") {
            self.log_format = value;
        }
        if let Ok(value) = std::env::var("TRACKER_FETCH_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse() {
                self.fetch_timeout_secs = secs;
            }
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
