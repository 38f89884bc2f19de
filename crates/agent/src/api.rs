//! HTTP client for the irrigation telemetry backend.
//!
//! All calls share one request timeout; a timed-out call fails exactly like
//! an unreachable backend, and callers are expected to fall back to cached
//! state rather than retry.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::zone::{Mode, TelemetryPayload};

/// Zone roster returned by `GET /api/ping`.
#[derive(Debug, Deserialize)]
pub struct PingResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, deserialize_with = "de_id_list")]
    pub zones: Vec<String>,
    #[serde(default)]
    pub modes: HashMap<String, Mode>,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    data: Option<TelemetryPayload>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    data: Option<Vec<TelemetryPayload>>,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct AutoResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    auto: bool,
}

#[derive(Debug, Deserialize)]
struct SetModeResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    mode: Mode,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// Build a client for `base_url` with the shared request `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let res = req
            .send()
            .await
            .with_context(|| format!("{what}: request failed"))?;
        let res = res
            .error_for_status()
            .with_context(|| format!("{what}: backend returned an error status"))?;
        res.json::<T>()
            .await
            .with_context(|| format!("{what}: invalid response body"))
    }

    /// Authoritative zone roster. Errors on any transport or status failure;
    /// the caller degrades to cached state.
    pub async fn ping(&self) -> Result<PingResponse> {
        self.execute(self.http.get(self.url("/api/ping")), "ping")
            .await
    }

    /// Latest telemetry for one zone, `None` when the backend has no data
    /// for the id.
    pub async fn latest(&self, area_id: &str) -> Result<Option<TelemetryPayload>> {
        let res: LatestResponse = self
            .execute(
                self.http
                    .get(self.url("/api/latest"))
                    .query(&[("area_id", area_id)]),
                "latest",
            )
            .await?;
        if !res.ok {
            return Ok(None);
        }
        Ok(res.data)
    }

    /// Telemetry rows for the trailing `minutes` window, oldest first.
    pub async fn history(&self, area_id: &str, minutes: u32) -> Result<Vec<TelemetryPayload>> {
        let res: HistoryResponse = self
            .execute(
                self.http
                    .get(self.url("/api/history"))
                    .query(&[("area_id", area_id.to_string()), ("minutes", minutes.to_string())]),
                "history",
            )
            .await?;
        Ok(res.data.unwrap_or_default())
    }

    /// Fire a pump command. Only meaningful while the zone is in manual mode.
    pub async fn send_command(&self, area_id: &str, on: bool) -> Result<()> {
        let order = if on { "1" } else { "0" };
        let res: AckResponse = self
            .execute(
                self.http
                    .post(self.url("/api/cmd"))
                    .query(&[("area_id", area_id), ("order", order)]),
                "cmd",
            )
            .await?;
        if !res.ok {
            bail!("cmd: backend rejected the pump command");
        }
        Ok(())
    }

    /// Toggle the backend's global auto-watering flag.
    pub async fn set_auto(&self, enabled: bool) -> Result<bool> {
        let flag = if enabled { "1" } else { "0" };
        let res: AutoResponse = self
            .execute(
                self.http
                    .post(self.url("/api/auto"))
                    .query(&[("enabled", flag)]),
                "auto",
            )
            .await?;
        if !res.ok {
            bail!("auto: backend rejected the toggle");
        }
        Ok(res.auto)
    }

    /// Request a zone mode change; returns the mode the backend applied.
    pub async fn set_mode(&self, area_id: &str, mode: Mode) -> Result<Mode> {
        let res: SetModeResponse = self
            .execute(
                self.http
                    .post(self.url("/api/set-mode"))
                    .query(&[("area_id", area_id), ("mode", mode.as_str())]),
                "set-mode",
            )
            .await?;
        if !res.ok {
            bail!("set-mode: backend rejected the mode change");
        }
        Ok(res.mode)
    }
}

/// Backend zone lists are strings in practice, but coerce numbers too and
/// skip anything else.
fn de_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient").field("base", &self.base).finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
