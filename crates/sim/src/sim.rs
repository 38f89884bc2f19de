//! Stateful soil moisture simulator for local development, working directly
//! in percent space:
//! - Temporal coherence via a mean-reverting random walk
//! - Gradual drying drift (evaporation)
//! - Per-tick uniform measurement noise
//! - Closed-loop watering response (moisture rises while the pump runs)

use std::fmt;

/// Uniform sample in `[-sigma, sigma]`.
fn noise(sigma: f64) -> f64 {
    (fastrand::f64() * 2.0 - 1.0) * sigma
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily. The default: exercises the
    /// critical-moisture advisory and auto-pump hysteresis within minutes.
    Drying,
    /// Hovers near the centre with low noise. Good for watching the agent
    /// without triggering alerts.
    Stable,
    /// Starts wet and dries very slowly. Verifies that nothing fires while
    /// moisture is adequate.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-zone simulator
// ---------------------------------------------------------------------------

/// Moisture state for one simulated zone. `tick()` advances the underlying
/// value and returns the next noisy measurement in `[0, 100]`.
pub struct ZoneSim {
    /// Current "true" soil moisture in percent.
    moist: f64,
    /// Drying drift per tick (percent, negative).
    drift: f64,
    /// Random-walk step bound (percent).
    walk_sigma: f64,
    /// Pull-toward-centre factor per tick.
    mean_reversion: f64,
    center: f64,
    /// Moisture gained per tick while the pump is running.
    wet_rate: f64,
    pump_on: bool,
}

impl ZoneSim {
    pub fn new(scenario: Scenario) -> Self {
        let (start, drift, walk_sigma, mean_reversion) = match scenario {
            Scenario::Drying => (55.0, -0.8, 1.2, 0.005),
            Scenario::Stable => (50.0, -0.05, 0.4, 0.05),
            Scenario::Wet => (85.0, -0.1, 0.6, 0.01),
        };
        // Small per-zone jitter so multiple zones diverge naturally.
        let start = (start + noise(4.0)).clamp(0.0, 100.0);
        Self {
            moist: start,
            drift,
            walk_sigma,
            mean_reversion,
            center: 50.0,
            wet_rate: 3.5,
            pump_on: false,
        }
    }

    /// Inform the simulator whether the pump is currently running.
    pub fn set_pump(&mut self, on: bool) {
        self.pump_on = on;
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    /// Advance one tick and return the next moisture measurement.
    pub fn tick(&mut self) -> f64 {
        let pull = self.mean_reversion * (self.center - self.moist);
        let wet = if self.pump_on { self.wet_rate } else { 0.0 };
        self.moist =
            (self.moist + self.drift + pull + wet + noise(self.walk_sigma)).clamp(0.0, 100.0);
        (self.moist + noise(0.5)).clamp(0.0, 100.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
