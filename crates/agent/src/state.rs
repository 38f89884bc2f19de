use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::reconcile::{CycleKind, CycleOutcome};
use crate::zone::DisplayZone;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Advisory shown while the agent serves cached state only.
pub const DEGRADED_ADVISORY: &str =
    "Live data unavailable; showing locally cached zone state.";

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub zones: Vec<DisplayZone>,
    pub degraded: bool,
    pub loading: bool,
    pub refreshing: bool,
    pub advisory: Option<String>,
    pub events: VecDeque<SystemEvent>,
    was_critical: bool,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Cycle,
    Command,
    Advisory,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub degraded: bool,
    pub loading: bool,
    pub refreshing: bool,
    pub advisory: Option<String>,
    pub zones: Vec<DisplayZone>,
    /// Names of zones whose moisture sits below the critical threshold.
    pub critical: Vec<String>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            zones: Vec::new(),
            degraded: false,
            loading: false,
            refreshing: false,
            advisory: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
            was_critical: false,
        }
    }

    /// Flip the visibility indicator for a starting cycle. Silent cycles
    /// never touch the indicators.
    pub fn begin_cycle(&mut self, kind: CycleKind) {
        match kind {
            CycleKind::Initial => self.loading = true,
            CycleKind::Refresh => self.refreshing = true,
            CycleKind::Silent => {}
        }
    }

    /// Publish a finished reconciliation cycle.
    pub fn apply_cycle(&mut self, outcome: CycleOutcome, critical_moisture: u8) {
        match outcome.kind {
            CycleKind::Initial => self.loading = false,
            CycleKind::Refresh => self.refreshing = false,
            CycleKind::Silent => {}
        }

        self.zones = outcome.zones;
        self.degraded = outcome.degraded;

        if outcome.degraded {
            // Silent cycles never surface errors; whatever advisory was
            // showing before stays as-is.
            if outcome.kind != CycleKind::Silent {
                self.advisory = Some(DEGRADED_ADVISORY.to_string());
                self.push_event(EventKind::Advisory, DEGRADED_ADVISORY.to_string());
            }
        } else {
            self.advisory = None;
        }

        if outcome.kind != CycleKind::Silent {
            self.push_event(
                EventKind::Cycle,
                format!(
                    "{} cycle reconciled {} zone(s){}",
                    outcome.kind,
                    self.zones.len(),
                    if outcome.degraded { " from cache" } else { "" }
                ),
            );
        }

        // Low-moisture alert fires on the transition into the critical
        // state, not on every cycle that stays there.
        let critical = self.critical_names(critical_moisture);
        let has_critical = !critical.is_empty();
        if has_critical && !self.was_critical {
            self.push_event(
                EventKind::Advisory,
                format!(
                    "moisture below {critical_moisture}% in: {}",
                    critical.join(", ")
                ),
            );
        }
        self.was_critical = has_critical;
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Names of zones below the moisture threshold, in display order.
    pub fn critical_names(&self, threshold: u8) -> Vec<String> {
        self.zones
            .iter()
            .filter(|z| z.water_level < threshold)
            .map(|z| z.name.clone())
            .collect()
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, critical_moisture: u8) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            degraded: self.degraded,
            loading: self.loading,
            refreshing: self.refreshing,
            advisory: self.advisory.clone(),
            zones: self.zones.clone(),
            critical: self.critical_names(critical_moisture),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
