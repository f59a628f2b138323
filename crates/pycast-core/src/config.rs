//! Configuration system for pycast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PYCAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pycast/config.toml
//!   3. ~/.config/pycast/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::session::TransferParams;
use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PycastConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display name advertised to receivers. Defaults to the local
    /// hostname, matching the original implementation's behavior.
    pub username: String,
    /// Where received files are written.
    pub download_folder: PathBuf,
    /// Whether a newly started session defaults to lobby (multi-client)
    /// mode rather than single-client mode.
    pub multiclient_enabled_by_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub handshake_port: u16,
    pub nack_port: u16,
    pub discovery_port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PycastConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            transfer: TransferParams::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            download_folder: dirs_or_home().join("Downloads"),
            multiclient_enabled_by_default: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_group: wire::DEFAULT_MULTICAST_GROUP,
            multicast_port: wire::DEFAULT_MULTICAST_PORT,
            handshake_port: wire::DEFAULT_HANDSHAKE_PORT,
            nack_port: wire::DEFAULT_NACK_PORT,
            discovery_port: wire::DEFAULT_DISCOVERY_PORT,
        }
    }
}

/// Default display username, taken from the local hostname. Falls
/// back to "pycast-user" if the hostname cannot be read, mirroring the
/// original implementation's `get_default_username`.
fn default_username() -> String {
    hostname_string().unwrap_or_else(|| "pycast-user".to_string())
}

#[cfg(unix)]
fn hostname_string() -> Option<String> {
    let raw = nix_gethostname().ok()?;
    raw.to_str().map(|s| s.to_string())
}

#[cfg(not(unix))]
fn hostname_string() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(unix)]
fn nix_gethostname() -> std::io::Result<std::ffi::OsString> {
    let mut buf = vec![0u8; 256];
    // SAFETY: buf is a valid writable byte buffer of the given length.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(len);
    Ok(std::ffi::OsString::from(String::from_utf8_lossy(&buf).into_owned()))
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pycast")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PycastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PycastConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PYCAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PycastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PYCAST_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PYCAST_IDENTITY__USERNAME") {
            self.identity.username = v;
        }
        if let Ok(v) = std::env::var("PYCAST_IDENTITY__DOWNLOAD_FOLDER") {
            self.identity.download_folder = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PYCAST_NETWORK__MULTICAST_PORT") {
            if let Ok(p) = v.parse() {
                self.network.multicast_port = p;
            }
        }
        if let Ok(v) = std::env::var("PYCAST_NETWORK__HANDSHAKE_PORT") {
            if let Ok(p) = v.parse() {
                self.network.handshake_port = p;
            }
        }
        if let Ok(v) = std::env::var("PYCAST_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("PYCAST_TRANSFER__REPAIR_ROUNDS") {
            if let Ok(n) = v.parse() {
                self.transfer.repair_rounds = n;
            }
        }
    }
}
