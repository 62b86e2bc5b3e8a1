//! Configuration file (`~/.config/snapsync/config.toml`).
//!
//! ```toml
//! btrfs = "/sbin/btrfs"
//! encap = "/root/bin/reliable-encap"
//!
//! [remote]
//! host = "backups.example.org"
//! user = "backup"
//! identity_file = ["/root/backups.id_rsa"]
//! command = ["snapsync", "server", "/srv/backups"]
//!
//! [server]
//! envelope_checksums = 2
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::server::ServeOptions;

/// Upper bound for `server.envelope_checksums`.
pub const MAX_ENVELOPE_CHECKSUMS: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// btrfs binary
    pub btrfs: PathBuf,
    /// Program that frames `btrfs send` output into envelopes
    pub encap: PathBuf,
    pub remote: RemoteConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            btrfs: PathBuf::from("btrfs"),
            encap: PathBuf::from("reliable-encap"),
            remote: RemoteConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// How to reach the peer over ssh.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Vec<PathBuf>,
    /// Command run on the remote host; its stdin/stdout carry the protocol.
    pub command: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: 22,
            identity_file: Vec::new(),
            command: vec!["snapsync".to_string(), "server".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub envelope_checksums: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            envelope_checksums: ServeOptions::default().envelope_checksums,
        }
    }
}

impl ServerConfig {
    pub fn serve_options(&self) -> ServeOptions {
        ServeOptions {
            envelope_checksums: self.envelope_checksums,
        }
    }
}

impl Config {
    /// Default location, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("snapsync").join("config.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(path, &text)
    }

    fn parse(path: &Path, text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let checksums = config.server.envelope_checksums;
        if !(1..=MAX_ENVELOPE_CHECKSUMS).contains(&checksums) {
            return Err(Error::Config {
                path: path.to_path_buf(),
                message: format!(
                    "server.envelope_checksums must be between 1 and {}, got {}",
                    MAX_ENVELOPE_CHECKSUMS, checksums
                ),
            });
        }
        Ok(config)
    }

    /// Load an explicit file, or the default file when it exists, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }
}
