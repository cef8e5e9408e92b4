//! Key Manager Configuration
//!
//! Loads the gateway's key-management configuration from a YAML file:
//! the local node address, the SA database location, the process-wide
//! negotiation and SA lifetimes, and one entry per configured route.
//!
//! # YAML Structure
//!
//! ```yaml
//! node_ip4: 10.0.0.1
//! sa_database: /run/vita/sa_db.yaml
//! negotiation_ttl: 5
//! sa_ttl: 600
//! routes:
//!   - id: site-b
//!     gateway: 203.0.113.2
//!     preshared_key: "0000000000000000000000000000000000000000000000000000000000000000"
//!     spi: 1234
//! ```

use crate::exchange::PRESHARED_KEY_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default upper bound on an in-flight exchange, in seconds.
pub const DEFAULT_NEGOTIATION_TTL_SECS: u64 = 5;

/// Default lifetime of a negotiated SA pair, in seconds.
pub const DEFAULT_SA_TTL_SECS: u64 = 600;

/// Default UDP port of the daemon's stand-in underlay.
pub const DEFAULT_UNDERLAY_PORT: u16 = 9899;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("route '{0}' has an empty identifier")]
    EmptyRouteId(String),

    #[error("duplicate route id: {0}")]
    DuplicateRouteId(String),

    #[error("duplicate route SPI: {0}")]
    DuplicateRouteSpi(u32),

    #[error("route '{route}': pre-shared key must be {expected} hex characters")]
    InvalidPresharedKey { route: String, expected: usize },
}

/// One configured tunnel to a peer gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Stable route identifier.
    pub id: String,
    /// Peer gateway address.
    pub gateway: Ipv4Addr,
    /// 32-byte pre-shared key, hex encoded.
    pub preshared_key: String,
    /// Route SPI bound into every exchange on this route.
    pub spi: u32,
}

impl RouteConfig {
    /// Decode the pre-shared key.
    pub fn preshared_key_bytes(&self) -> Result<[u8; PRESHARED_KEY_SIZE], ConfigError> {
        let invalid = || ConfigError::InvalidPresharedKey {
            route: self.id.clone(),
            expected: PRESHARED_KEY_SIZE * 2,
        };
        let bytes = hex::decode(&self.preshared_key).map_err(|_| invalid())?;
        bytes.try_into().map_err(|_| invalid())
    }
}

/// Root configuration structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local node address, used as the source of emitted datagrams.
    pub node_ip4: Ipv4Addr,

    /// Where the SA database is published for the worker processes.
    pub sa_database: PathBuf,

    /// Upper bound on an in-flight exchange, in seconds.
    #[serde(default = "default_negotiation_ttl")]
    pub negotiation_ttl: u64,

    /// Lifetime of a negotiated SA pair, in seconds.
    #[serde(default = "default_sa_ttl")]
    pub sa_ttl: u64,

    /// UDP port of the daemon's stand-in underlay.
    #[serde(default = "default_underlay_port")]
    pub underlay_port: u16,

    /// Configured routes.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_negotiation_ttl() -> u64 {
    DEFAULT_NEGOTIATION_TTL_SECS
}

fn default_sa_ttl() -> u64 {
    DEFAULT_SA_TTL_SECS
}

fn default_underlay_port() -> u16 {
    DEFAULT_UNDERLAY_PORT
}

impl Config {
    /// Load and validate configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check route identifiers, SPIs, and pre-shared keys.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let mut spis = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                return Err(ConfigError::EmptyRouteId(route.id.clone()));
            }
            if !ids.insert(route.id.as_str()) {
                return Err(ConfigError::DuplicateRouteId(route.id.clone()));
            }
            if !spis.insert(route.spi) {
                return Err(ConfigError::DuplicateRouteSpi(route.spi));
            }
            route.preshared_key_bytes()?;
        }
        Ok(())
    }

    pub fn negotiation_ttl_ms(&self) -> u64 {
        self.negotiation_ttl * 1_000
    }

    pub fn sa_ttl_ms(&self) -> u64 {
        self.sa_ttl * 1_000
    }
}
