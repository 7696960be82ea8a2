//! Configuration management for the vault server and client

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;
use crate::error::{ProtocolError, ProtocolResult};
use crate::keyhandler::LayerSuite;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Key derivation and layer settings
    #[serde(default)]
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Directory holding account files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Drop a connection after this many idle seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server to connect to
    #[serde(default = "default_listen")]
    pub server: SocketAddr,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// `;`-separated layer algorithms, at least three
    #[serde(default = "default_layers")]
    pub layers: String,

    /// Master secret derivation cost
    #[serde(default)]
    pub kdf: KdfConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,

    #[serde(default = "default_iterations")]
    pub iterations: u32,

    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

// Default value functions
fn default_listen() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 7100)) }
fn default_data_dir() -> PathBuf { PathBuf::from("./vault-data") }
fn default_idle_timeout() -> u64 { 300 }
fn default_connect_timeout() -> u64 { 30 }
fn default_layers() -> String { LayerSuite::default().to_string() }
fn default_memory_kib() -> u32 { KdfParams::default().memory_kib }
fn default_iterations() -> u32 { KdfParams::default().iterations }
fn default_parallelism() -> u32 { KdfParams::default().parallelism }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_listen(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            layers: default_layers(),
            kdf: KdfConfig::default(),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl ServerConfig {
    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ClientConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl CryptoConfig {
    /// Parsed layer suite
    pub fn layer_suite(&self) -> ProtocolResult<LayerSuite> {
        self.layers.parse()
    }

    /// Argon2 cost parameters
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf.memory_kib,
            iterations: self.kdf.iterations,
            parallelism: self.kdf.parallelism,
        }
    }
}

impl Config {
    /// Check every value converts into its typed form
    pub fn validate(&self) -> ProtocolResult<()> {
        self.crypto.layer_suite()?;
        self.crypto.kdf_params().validate()?;
        if self.server.idle_timeout_secs == 0 {
            return Err(ProtocolError::InvalidConfiguration(
                "idle_timeout_secs must be positive".to_string(),
            ));
        }
        if self.client.connect_timeout_secs == 0 {
            return Err(ProtocolError::InvalidConfiguration(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and validate configuration from a TOML file
pub fn load(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to a file
pub fn save(config: &Config, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

/// Generate a sample configuration file
pub fn generate_sample() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_default()
}
