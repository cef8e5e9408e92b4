//! Security Association Records and the Published SA Database
//!
//! The manager distils every completed exchange into a pair of Security
//! Associations and publishes the full set as a YAML document keyed by
//! ephemeral SPI. The encrypt/decrypt worker processes watch that file
//! for modification and re-parse it on change; the manager therefore
//! replaces it atomically (write to a temporary sibling, then rename) so
//! a watcher never observes a half-written snapshot, and throttles the
//! rewrite to at most once per second.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Size of an AEAD key in the published database.
pub const SA_KEY_SIZE: usize = 16;

/// Size of an AEAD salt in the published database.
pub const SA_SALT_SIZE: usize = 4;

/// Minimum interval between database rewrites.
pub const COMMIT_INTERVAL_MS: u64 = 1_000;

/// Errors from SA database persistence.
#[derive(Debug, Error)]
pub enum SaDatabaseError {
    #[error("failed to serialize SA database: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("failed to write SA database {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The AEAD every SA is keyed for. Fixed; never negotiated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EspAead {
    #[default]
    #[serde(rename = "aes-gcm-16-icv")]
    AesGcm16Icv,
}

impl fmt::Display for EspAead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EspAead::AesGcm16Icv => write!(f, "aes-gcm-16-icv"),
        }
    }
}

/// A keyed, directional channel descriptor for the ESP data plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssociation {
    /// Identifier of the owning route.
    pub route: String,
    /// Ephemeral SPI tagging packets under this SA.
    pub spi: u32,
    pub aead: EspAead,
    #[serde(with = "hex_bytes")]
    pub key: [u8; SA_KEY_SIZE],
    #[serde(with = "hex_bytes")]
    pub salt: [u8; SA_SALT_SIZE],
}

/// The published artifact: outbound and inbound SA maps keyed by SPI.
///
/// `inbound_sa` may carry two entries for one route during a rekey
/// cutover: the current SA and its superseded predecessor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaDatabase {
    #[serde(default)]
    pub outbound_sa: BTreeMap<u32, SecurityAssociation>,
    #[serde(default)]
    pub inbound_sa: BTreeMap<u32, SecurityAssociation>,
}

impl SaDatabase {
    pub fn is_empty(&self) -> bool {
        self.outbound_sa.is_empty() && self.inbound_sa.is_empty()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }
}

/// Throttled atomic writer for the SA database file.
///
/// Tracks a dirty flag and the time of the last flush; [`SaPublisher::maybe_commit`]
/// only touches the filesystem when both permit it.
#[derive(Debug)]
pub struct SaPublisher {
    path: PathBuf,
    dirty: bool,
    last_commit: Option<u64>,
}

impl SaPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dirty: false,
            last_commit: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note that the SA set changed and a rewrite is due.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rewrite the database unconditionally.
    pub fn commit(&mut self, database: &SaDatabase, now_ms: u64) -> Result<(), SaDatabaseError> {
        // Start the throttle window even if the write fails, so a broken
        // target path cannot turn every tick into a filesystem error.
        self.last_commit = Some(now_ms);
        let document = database.to_yaml()?;
        let temporary = self.path.with_extension("tmp");
        fs::write(&temporary, document).map_err(|source| SaDatabaseError::Write {
            path: temporary.clone(),
            source,
        })?;
        fs::rename(&temporary, &self.path).map_err(|source| SaDatabaseError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }

    /// Rewrite the database if it is dirty and the throttle window has
    /// passed. Returns whether a commit happened.
    pub fn maybe_commit(
        &mut self,
        database: &SaDatabase,
        now_ms: u64,
    ) -> Result<bool, SaDatabaseError> {
        if !self.dirty {
            return Ok(false);
        }
        if let Some(last) = self.last_commit {
            if now_ms < last + COMMIT_INTERVAL_MS {
                return Ok(false);
            }
        }
        self.commit(database, now_ms)?;
        Ok(true)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("wrong length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_sa(route: &str, spi: u32) -> SecurityAssociation {
        SecurityAssociation {
            route: route.to_string(),
            spi,
            aead: EspAead::AesGcm16Icv,
            key: [0x0F; SA_KEY_SIZE],
            salt: [0xA0; SA_SALT_SIZE],
        }
    }

    fn sample_database() -> SaDatabase {
        let mut database = SaDatabase::default();
        database.inbound_sa.insert(300, sample_sa("site-b", 300));
        database.inbound_sa.insert(301, sample_sa("site-b", 301));
        database.outbound_sa.insert(512, sample_sa("site-b", 512));
        database
    }

    #[test]
    fn test_yaml_round_trip() {
        let database = sample_database();
        let document = database.to_yaml().unwrap();
        assert_eq!(SaDatabase::from_yaml(&document).unwrap(), database);
    }

    #[test]
    fn test_document_shape() {
        let document = sample_database().to_yaml().unwrap();
        assert!(document.contains("outbound_sa:"));
        assert!(document.contains("inbound_sa:"));
        assert!(document.contains("route: site-b"));
        assert!(document.contains("aead: aes-gcm-16-icv"));
        // Keys and salts are hex: 32 and 8 characters.
        assert!(document.contains(&"0f".repeat(SA_KEY_SIZE)));
        assert!(document.contains(&"a0".repeat(SA_SALT_SIZE)));
    }

    #[test]
    fn test_bad_hex_rejected() {
        let document = sample_database()
            .to_yaml()
            .unwrap()
            .replace(&"0f".repeat(SA_KEY_SIZE), "zz");
        assert!(SaDatabase::from_yaml(&document).is_err());
    }

    #[test]
    fn test_commit_replaces_file_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sa_db.yaml");
        let mut publisher = SaPublisher::new(&path);

        publisher.commit(&SaDatabase::default(), 0).unwrap();
        let empty = fs::read_to_string(&path).unwrap();
        assert!(SaDatabase::from_yaml(&empty).unwrap().is_empty());

        publisher.commit(&sample_database(), 1).unwrap();
        let full = SaDatabase::from_yaml(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(full, sample_database());

        // No temporary file is left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_maybe_commit_respects_dirty_flag_and_throttle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sa_db.yaml");
        let mut publisher = SaPublisher::new(&path);
        let database = sample_database();

        // Clean: nothing to do.
        assert!(!publisher.maybe_commit(&database, 0).unwrap());
        assert!(!path.exists());

        publisher.mark_dirty();
        assert!(publisher.maybe_commit(&database, 0).unwrap());

        // Dirty again, but inside the throttle window.
        publisher.mark_dirty();
        assert!(!publisher.maybe_commit(&database, 500).unwrap());
        assert!(publisher.is_dirty());

        // Window elapsed.
        assert!(publisher.maybe_commit(&database, COMMIT_INTERVAL_MS).unwrap());
        assert!(!publisher.is_dirty());
    }
}
