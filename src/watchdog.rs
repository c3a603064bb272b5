//! Safety monitors evaluated on every telemetry sample.
//!
//! The evaluators here are plain state machines. They take the measured
//! values and the current time as arguments and report whether they tripped;
//! stopping the load and notifying observers is done by the caller
//! ([`crate::load`]). Passing time in explicitly keeps the series resistance
//! hysteresis testable without sleeping.

use crate::device::TelemetrySample;
use crate::protocol::{Comparison, Quantity};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// How long the series resistor may dissipate more than its limit.
pub const SERIES_OVERLOAD_GRACE: Duration = Duration::from_secs(1);

/// Smallest accepted series resistor power limit, W.
pub const MIN_SERIES_POWER_LIMIT: f64 = 0.1;

/// Default series resistor power limit, W.
pub const DEFAULT_SERIES_POWER_LIMIT: f64 = 100.0;

/// Trips once when a measured quantity crosses a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueWatchdog {
    /// Armed.
    pub enabled: bool,
    /// Quantity compared against `threshold`.
    pub quantity: Quantity,
    /// Side of the threshold that trips.
    pub comparison: Comparison,
    /// Threshold in the unit of `quantity`.
    pub threshold: f64,
}

impl Default for ValueWatchdog {
    fn default() -> Self {
        Self {
            enabled: false,
            quantity: Quantity::Current,
            comparison: Comparison::MoreThan,
            threshold: 0.0,
        }
    }
}

impl ValueWatchdog {
    /// Check `sample`. A trip disarms the watchdog; re-arming is up to the user.
    pub fn evaluate(&mut self, sample: &TelemetrySample, open_circuit: f64) -> bool {
        if !self.enabled {
            return false;
        }
        let measured = sample.quantity(self.quantity, open_circuit);
        if self.comparison.holds(measured, self.threshold) {
            self.enabled = false;
            return true;
        }
        false
    }
}

impl std::fmt::Display for ValueWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stop if {} {} {} {}",
            self.quantity,
            self.comparison.symbol(),
            self.threshold,
            self.quantity.unit()
        )
    }
}

/// Protects an external resistor in series with the load.
///
/// Power in the resistor is `R * I²`. Above the limit a grace period runs;
/// dropping back under the limit restarts it. After a trip the watchdog stays
/// latched until the power falls under the limit again, so one overload
/// produces exactly one trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesResistanceWatchdog {
    enabled: bool,
    power_limit: f64,
    last_ok: Option<Instant>,
    latched: bool,
}

impl Default for SeriesResistanceWatchdog {
    fn default() -> Self {
        Self {
            enabled: false,
            power_limit: DEFAULT_SERIES_POWER_LIMIT,
            last_ok: None,
            latched: false,
        }
    }
}

impl SeriesResistanceWatchdog {
    /// Watchdog with `power_limit`, falling back to the default limit if it is too small.
    pub fn new(enabled: bool, power_limit: f64) -> Self {
        let mut watchdog = Self::default();
        watchdog.set_power_limit(power_limit);
        watchdog.set_enabled(enabled);
        watchdog
    }

    /// Armed.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Arm or disarm. Either way the grace timer restarts.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.last_ok = None;
        self.latched = false;
    }

    /// Limit in W.
    pub fn power_limit(&self) -> f64 {
        self.power_limit
    }

    /// Change the limit. Values at or below 0.1 W are ignored; returns
    /// whether the limit was accepted.
    pub fn set_power_limit(&mut self, watts: f64) -> bool {
        if watts > MIN_SERIES_POWER_LIMIT {
            self.power_limit = watts;
            true
        } else {
            false
        }
    }

    /// Check one sample taken at `now`. Returns `true` on the sample that
    /// trips.
    pub fn evaluate(&mut self, series_resistance: f64, current: f64, now: Instant) -> bool {
        if !self.enabled {
            self.last_ok = None;
            self.latched = false;
            return false;
        }

        let power = series_resistance * current * current;
        if power <= self.power_limit {
            self.last_ok = Some(now);
            self.latched = false;
            return false;
        }

        let since = *self.last_ok.get_or_insert(now);
        if self.latched || now.duration_since(since) <= SERIES_OVERLOAD_GRACE {
            return false;
        }
        self.latched = true;
        true
    }
}
