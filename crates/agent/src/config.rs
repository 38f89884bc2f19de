//! TOML config loading and validation for the sync agent.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::zone::StoredZone;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// Shared request timeout for every backend call.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    /// Silent reconciliation cadence.
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    /// Moisture percentage below which a zone counts as critical.
    #[serde(default = "default_critical_moisture")]
    pub critical_moisture: u8,
    /// Token identifying the protected "connected" zone (substring match,
    /// case-insensitive). Also the default seed zone id.
    #[serde(default = "default_connected_zone_id")]
    pub connected_zone_id: String,
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default)]
    pub seed: Option<SeedZone>,
}

/// Optional override for the zone seeded on first run.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedZone {
    pub id: Option<String>,
    pub name: Option<String>,
    pub color: Option<String>,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout_sec() -> u64 {
    8
}

fn default_poll_interval_sec() -> u64 {
    5
}

fn default_critical_moisture() -> u8 {
    30
}

fn default_connected_zone_id() -> String {
    "area-main".to_string()
}

fn default_store_dir() -> String {
    "data".to_string()
}

fn default_web_port() -> u16 {
    8090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            request_timeout_sec: default_request_timeout_sec(),
            poll_interval_sec: default_poll_interval_sec(),
            critical_moisture: default_critical_moisture(),
            connected_zone_id: default_connected_zone_id(),
            store_dir: default_store_dir(),
            web_port: default_web_port(),
            seed: None,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    /// The record written to an empty store on first run.
    pub fn seed_zone(&self) -> StoredZone {
        let seed = self.seed.as_ref();
        let id = seed
            .and_then(|s| s.id.clone())
            .unwrap_or_else(|| self.connected_zone_id.clone());
        StoredZone {
            name: seed.and_then(|s| s.name.clone()),
            color: Some(
                seed.and_then(|s| s.color.clone())
                    .unwrap_or_else(|| "#e0f2f1".to_string()),
            ),
            ..StoredZone::bare(&id)
        }
    }

    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.backend_url.trim().is_empty() {
            errors.push("backend_url is empty".to_string());
        } else if !self.backend_url.starts_with("http://")
            && !self.backend_url.starts_with("https://")
        {
            errors.push(format!(
                "backend_url '{}' must start with http:// or https://",
                self.backend_url
            ));
        }

        if self.request_timeout_sec == 0 {
            errors.push("request_timeout_sec must be positive".to_string());
        }
        if self.poll_interval_sec == 0 {
            errors.push("poll_interval_sec must be positive".to_string());
        }
        if self.critical_moisture > 100 {
            errors.push(format!(
                "critical_moisture {} out of range [0, 100]",
                self.critical_moisture
            ));
        }
        if self.connected_zone_id.trim().is_empty() {
            errors.push("connected_zone_id is empty".to_string());
        }
        if self.store_dir.trim().is_empty() {
            errors.push("store_dir is empty".to_string());
        }
        if self.web_port == 0 {
            errors.push("web_port must be positive".to_string());
        }

        if let Some(seed) = &self.seed {
            if let Some(id) = &seed.id {
                if id.trim().is_empty() {
                    errors.push("seed.id is empty".to_string());
                }
            }
            if let Some(color) = &seed.color {
                if !is_hex_color(color) {
                    errors.push(format!("seed.color '{color}' is not a #rrggbb color"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7
        && s.starts_with('#')
        && s.chars().skip(1).all(|c| c.is_ascii_hexdigit())
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
