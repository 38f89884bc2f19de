//! Flat key-value persistence for zone records and profile settings.
//!
//! One file per key under a root directory. The `zones` key holds a single
//! JSON array of [`StoredZone`]; writes always replace the whole array (last
//! writer wins, no locking). Overlapping poll cycles can race a write, which
//! is tolerated: both writers converge on the same remote-derived state.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::zone::StoredZone;

pub const ZONES_KEY: &str = "zones";
pub const PROFILE_NAME_KEY: &str = "userName";
pub const PROFILE_IMAGE_KEY: &str = "profileImage";

#[derive(Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store dir: {}", root.display()))?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Raw value for `key`, or `None` if the key has never been written.
    pub async fn read_raw(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.key_path(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read store key '{key}'")),
        }
    }

    pub async fn write_raw(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::write(self.key_path(key), value)
            .await
            .with_context(|| format!("failed to write store key '{key}'"))
    }

    // ----------------------------
    // Zones
    // ----------------------------

    /// All persisted zone records. Lenient by contract: a missing key, a
    /// malformed blob, or an unreadable file all degrade to an empty list,
    /// and individual unparseable records are skipped rather than failing
    /// the batch.
    pub async fn read_zones(&self) -> Vec<StoredZone> {
        let raw = match self.read_raw(ZONES_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("store: zones read failed: {e:#}");
                return Vec::new();
            }
        };

        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(serde_json::Value::Array(values)) => values,
            Ok(_) => {
                warn!("store: zones blob is not an array — ignoring");
                return Vec::new();
            }
            Err(e) => {
                warn!("store: zones blob unparseable: {e}");
                return Vec::new();
            }
        };

        values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<StoredZone>(value) {
                Ok(zone) => Some(zone),
                Err(e) => {
                    warn!("store: skipping malformed zone record: {e}");
                    None
                }
            })
            .collect()
    }

    /// Overwrite the full zone array.
    pub async fn write_zones(&self, zones: &[StoredZone]) -> Result<()> {
        let serialized = serde_json::to_string(zones).context("failed to serialize zones")?;
        self.write_raw(ZONES_KEY, &serialized).await
    }

    // ----------------------------
    // Profile
    // ----------------------------

    pub async fn profile_name(&self) -> Option<String> {
        self.read_raw(PROFILE_NAME_KEY).await.ok().flatten()
    }

    pub async fn set_profile_name(&self, name: &str) -> Result<()> {
        self.write_raw(PROFILE_NAME_KEY, name).await
    }

    pub async fn profile_image(&self) -> Option<String> {
        self.read_raw(PROFILE_IMAGE_KEY).await.ok().flatten()
    }

    pub async fn set_profile_image(&self, uri: &str) -> Result<()> {
        self.write_raw(PROFILE_IMAGE_KEY, uri).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
