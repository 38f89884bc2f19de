//! Zone record types and the merge helpers that fold remote telemetry into
//! locally persisted metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Fallback card color when neither the store nor the palette supplied one.
pub const DEFAULT_COLOR: &str = "#e2e8f0";

/// Cycled through for zones that have no persisted color.
pub const COLOR_PALETTE: &[&str] = &[
    "#fde2e4", "#e0f2f1", "#dcedc8", "#e0e7ff", "#fef3c7", "#fbcfe8", "#bbf7d0", "#bae6fd",
];

// ---------------------------------------------------------------------------
// Irrigation mode
// ---------------------------------------------------------------------------

/// Per-zone irrigation mode. Everything that is not exactly `"manual"`
/// normalizes to `Auto` — stored blobs and remote payloads both pass through
/// the lenient `Deserialize` below.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Manual,
}

impl Mode {
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            _ => Self::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = Mode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "an irrigation mode string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Mode, E> {
                Ok(Mode::from_str_lossy(value))
            }

            // Stored blobs have carried numbers and nulls here; all of them
            // normalize to auto rather than poisoning the whole record.
            fn visit_bool<E>(self, _: bool) -> Result<Mode, E> {
                Ok(Mode::Auto)
            }

            fn visit_i64<E>(self, _: i64) -> Result<Mode, E> {
                Ok(Mode::Auto)
            }

            fn visit_u64<E>(self, _: u64) -> Result<Mode, E> {
                Ok(Mode::Auto)
            }

            fn visit_f64<E>(self, _: f64) -> Result<Mode, E> {
                Ok(Mode::Auto)
            }

            fn visit_unit<E>(self) -> Result<Mode, E> {
                Ok(Mode::Auto)
            }
        }
        deserializer.deserialize_any(V)
    }
}

// ---------------------------------------------------------------------------
// Persisted and wire records
// ---------------------------------------------------------------------------

/// One zone record as persisted in the local store. Every field except `id`
/// is optional; defaulting happens at merge time, not at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredZone {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "de_percent")]
    pub water_level: u8,
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub mode: Mode,
}

impl StoredZone {
    /// A bare record carrying only an id; used when seeding metadata for a
    /// zone the backend announced but the store has never seen.
    pub fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            color: None,
            image: None,
            water_level: 0,
            last_update: None,
            mode: Mode::Auto,
        }
    }
}

/// Latest-measurement payload as returned by `GET /api/latest`. Ephemeral:
/// only derived fields are folded into [`StoredZone`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub dryness: Option<f64>,
    #[serde(default)]
    pub moist: Option<f64>,
    #[serde(default)]
    pub last_pump: Option<i64>,
    #[serde(default)]
    pub mode: Option<Mode>,
}

/// The reconciled view of one zone: stored metadata resolved against the
/// freshest telemetry. Never persisted as such — [`DisplayZone::to_stored`]
/// projects the persistable subset back out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayZone {
    pub id: String,
    pub name: String,
    pub color: String,
    pub image: Option<String>,
    pub water_level: u8,
    pub dryness: u8,
    pub last_update: Option<String>,
    pub mode: Mode,
    pub telemetry: Option<TelemetryPayload>,
}

impl DisplayZone {
    pub fn pump_on(&self) -> bool {
        self.telemetry
            .as_ref()
            .and_then(|t| t.last_pump)
            .map(|p| p == 1)
            .unwrap_or(false)
    }

    pub fn to_stored(&self) -> StoredZone {
        StoredZone {
            id: self.id.clone(),
            name: Some(self.name.clone()),
            color: Some(self.color.clone()),
            image: self.image.clone(),
            water_level: self.water_level,
            last_update: self.last_update.clone(),
            mode: self.mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Lenient field deserializers
// ---------------------------------------------------------------------------

/// Zone ids are strings, but old blobs stored them as numbers.
fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;
    impl<'de> serde::de::Visitor<'de> for V {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a zone id (string or number)")
        }

        fn visit_str<E>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_u64<E>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_f64<E>(self, value: f64) -> Result<String, E> {
            if value.fract() == 0.0 {
                Ok(format!("{}", value as i64))
            } else {
                Ok(value.to_string())
            }
        }
    }
    deserializer.deserialize_any(V)
}

/// Water levels in old blobs range from floats to nulls; clamp on the way in.
fn de_percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;
    impl<'de> serde::de::Visitor<'de> for V {
        type Value = u8;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a percentage")
        }

        fn visit_i64<E>(self, value: i64) -> Result<u8, E> {
            Ok(clamp_percent(value as f64, 0))
        }

        fn visit_u64<E>(self, value: u64) -> Result<u8, E> {
            Ok(clamp_percent(value as f64, 0))
        }

        fn visit_f64<E>(self, value: f64) -> Result<u8, E> {
            Ok(clamp_percent(value, 0))
        }

        fn visit_str<E>(self, value: &str) -> Result<u8, E> {
            Ok(value
                .trim()
                .parse::<f64>()
                .map(|v| clamp_percent(v, 0))
                .unwrap_or(0))
        }

        fn visit_unit<E>(self) -> Result<u8, E> {
            Ok(0)
        }
    }
    deserializer.deserialize_any(V)
}

// ---------------------------------------------------------------------------
// Merge helpers
// ---------------------------------------------------------------------------

/// Round and clamp a percentage to an integer in `[0, 100]`. Non-finite
/// input yields `fallback`.
pub fn clamp_percent(value: f64, fallback: u8) -> u8 {
    if value.is_finite() {
        value.round().clamp(0.0, 100.0) as u8
    } else {
        fallback
    }
}

/// Derive a display name from a raw zone id: separators become spaces, the
/// first letter is upcased. Ids that collapse to nothing get a generic label.
pub fn prettify_id(id: &str) -> String {
    let clean = id
        .split(['_', '-'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let clean = clean.trim();
    if clean.is_empty() {
        return format!("Zone {id}");
    }
    let mut chars = clean.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => format!("Zone {id}"),
    }
}

/// Palette color for the zone at position `idx` in the reconciled list.
pub fn palette_color(idx: usize) -> &'static str {
    COLOR_PALETTE[idx % COLOR_PALETTE.len()]
}

/// Whether `id` names the protected "connected" zone (the one physical
/// installation the app ships with). Substring match, case-insensitive.
pub fn is_connected_zone(id: &str, token: &str) -> bool {
    id.to_lowercase().contains(&token.to_lowercase())
}

/// Fold one telemetry payload into one stored record.
///
/// Precedence per field: telemetry moisture over stored level over 0;
/// telemetry dryness over `100 - moisture`; telemetry timestamp over stored
/// timestamp; telemetry mode over stored mode.
pub fn build_display_zone(meta: &StoredZone, telemetry: Option<TelemetryPayload>) -> DisplayZone {
    let t = telemetry.as_ref();
    let moisture = clamp_percent(
        t.and_then(|t| t.moist).unwrap_or(meta.water_level as f64),
        0,
    );
    let dryness = clamp_percent(
        t.and_then(|t| t.dryness)
            .unwrap_or(100.0 - moisture as f64),
        0,
    );
    let last_update = t
        .and_then(|t| t.ts.clone())
        .or_else(|| meta.last_update.clone());
    let mode = t.and_then(|t| t.mode).unwrap_or(meta.mode);

    let name = match meta.name.as_deref().map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => prettify_id(&meta.id),
    };

    DisplayZone {
        id: meta.id.clone(),
        name,
        color: meta
            .color
            .clone()
            .unwrap_or_else(|| DEFAULT_COLOR.to_string()),
        image: meta.image.clone(),
        water_level: moisture,
        dryness,
        last_update,
        mode,
        telemetry,
    }
}

/// Human-friendly age of the last measurement, relative to `now`.
pub fn humanize_last_update(iso: Option<&str>, now: OffsetDateTime) -> String {
    let Some(iso) = iso else {
        return "no recent data".to_string();
    };
    let Ok(ts) = OffsetDateTime::parse(iso, &Rfc3339) else {
        return "unknown timestamp".to_string();
    };
    let diff_sec = (now - ts).whole_seconds().max(0);
    if diff_sec < 60 {
        "less than 1 min ago".to_string()
    } else if diff_sec < 3600 {
        format!("{} min ago", diff_sec / 60)
    } else if diff_sec < 86400 {
        format!("{} h ago", diff_sec / 3600)
    } else {
        format!("{:04}-{:02}-{:02}", ts.year(), ts.month() as u8, ts.day())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
