//! Program items and skip conditions.
//!
//! Items deserialize from a tagged table, which is how the `[[program.items]]`
//! entries of the configuration file are written:
//!
//! ```toml
//! [[program.items]]
//! kind = "ramp"
//! mode = "voltage"
//! end = 5.0
//! duration = "2s"
//! skip = { quantity = "current", comparison = "more_than", threshold = 2.0 }
//! ```

use crate::error::{LoadError, LoadResult};
use crate::protocol::{Comparison, Quantity, RunMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Early exit from a constant or ramp item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkipCondition {
    /// Measured quantity to watch.
    pub quantity: Quantity,
    /// Side of the threshold that ends the item.
    pub comparison: Comparison,
    /// Threshold in the unit of `quantity`.
    pub threshold: f64,
}

impl SkipCondition {
    /// Whether `measured` (a value of `self.quantity`) ends the item.
    pub fn is_met(&self, measured: f64) -> bool {
        self.comparison.holds(measured, self.threshold)
    }
}

impl fmt::Display for SkipCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "skip if {} {} {} {}",
            self.quantity,
            self.comparison.symbol(),
            self.threshold,
            self.quantity.unit()
        )
    }
}

/// One step of a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgramItem {
    /// Hold `value` for `duration`. Without a value the last measured value
    /// in the mode's unit is held.
    Constant {
        /// Regulation mode.
        mode: RunMode,
        /// Held set-point, `None` for the last measured value.
        #[serde(default)]
        value: Option<f64>,
        /// How long to hold.
        #[serde(with = "humantime_serde")]
        duration: Duration,
        /// Optional early exit.
        #[serde(default)]
        skip: Option<SkipCondition>,
    },
    /// Linear ramp from `start` (or the last measured value) to `end`.
    Ramp {
        /// Regulation mode.
        mode: RunMode,
        /// First set-point, `None` for the last measured value.
        #[serde(default)]
        start: Option<f64>,
        /// Final set-point.
        end: f64,
        /// Ramp length.
        #[serde(with = "humantime_serde")]
        duration: Duration,
        /// Optional early exit.
        #[serde(default)]
        skip: Option<SkipCondition>,
    },
    /// Drive a user pin. Takes no time.
    Pin {
        /// Pin index; 5 or more addresses every pin.
        pin: u8,
        /// High when true.
        set: bool,
    },
}

impl ProgramItem {
    /// Constant item without a skip condition.
    pub fn constant(mode: RunMode, value: Option<f64>, duration: Duration) -> Self {
        ProgramItem::Constant {
            mode,
            value,
            duration,
            skip: None,
        }
    }

    /// Ramp item without a skip condition.
    pub fn ramp(mode: RunMode, start: Option<f64>, end: f64, duration: Duration) -> Self {
        ProgramItem::Ramp {
            mode,
            start,
            end,
            duration,
            skip: None,
        }
    }

    /// Pin item.
    pub fn pin(pin: u8, set: bool) -> Self {
        ProgramItem::Pin { pin, set }
    }

    /// Attach a skip condition. Pin items ignore it.
    pub fn with_skip(mut self, condition: SkipCondition) -> Self {
        match &mut self {
            ProgramItem::Constant { skip, .. } | ProgramItem::Ramp { skip, .. } => {
                *skip = Some(condition);
            }
            ProgramItem::Pin { .. } => {}
        }
        self
    }

    /// Nominal duration; zero for pin items.
    pub fn duration(&self) -> Duration {
        match self {
            ProgramItem::Constant { duration, .. } | ProgramItem::Ramp { duration, .. } => {
                *duration
            }
            ProgramItem::Pin { .. } => Duration::ZERO,
        }
    }

    /// Skip condition, if any.
    pub fn skip(&self) -> Option<&SkipCondition> {
        match self {
            ProgramItem::Constant { skip, .. } | ProgramItem::Ramp { skip, .. } => skip.as_ref(),
            ProgramItem::Pin { .. } => None,
        }
    }

    /// Reject items the device cannot execute.
    ///
    /// Ramps need a set-point that can be interpolated, which rules out the
    /// tracker and ammeter modes.
    pub fn validate(&self) -> LoadResult<()> {
        match self {
            ProgramItem::Ramp { mode, .. }
                if matches!(mode, RunMode::Mppt | RunMode::SimpleAmmeter) =>
            {
                Err(LoadError::UnsupportedMode(*mode))
            }
            _ => Ok(()),
        }
    }
}

/// `(CC)` / `(CV)` style qualifiers belong inside the "use previous" note.
fn split_name(mode: RunMode) -> (&'static str, Option<&'static str>) {
    match mode {
        RunMode::PowerCc => ("power", Some("CC")),
        RunMode::PowerCv => ("power", Some("CV")),
        RunMode::ResistanceCc => ("resistance", Some("CC")),
        RunMode::ResistanceCv => ("resistance", Some("CV")),
        RunMode::Current => ("current", None),
        RunMode::Voltage => ("voltage", None),
        RunMode::VoltageSoftware => ("SW controlled voltage", None),
        RunMode::Mppt => ("maximum power point tracker", None),
        RunMode::SimpleAmmeter => ("simple ammeter", None),
    }
}

fn write_value(
    f: &mut fmt::Formatter<'_>,
    mode: RunMode,
    value: Option<f64>,
) -> fmt::Result {
    let (name, qualifier) = split_name(mode);
    match (value, qualifier) {
        (Some(v), Some(q)) => write!(f, "{name} ({q}) {v} {}", mode.unit()),
        (Some(v), None) if mode.has_setpoint() => write!(f, "{name} {v} {}", mode.unit()),
        (Some(_), None) => write!(f, "{name}"),
        (None, Some(q)) => write!(f, "{name} ({q}, use previous)"),
        (None, None) => write!(f, "{name} (use previous)"),
    }
}

fn seconds(duration: Duration) -> String {
    format!("{} s", duration.as_secs_f64())
}

impl fmt::Display for ProgramItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramItem::Constant {
                mode,
                value,
                duration,
                skip,
            } => {
                f.write_str("Constant ")?;
                write_value(f, *mode, *value)?;
                write!(f, ", {}", seconds(*duration))?;
                if let Some(skip) = skip {
                    write!(f, "; {skip}")?;
                }
                Ok(())
            }
            ProgramItem::Ramp {
                mode,
                start,
                end,
                duration,
                skip,
            } => {
                f.write_str("Ramp ")?;
                write_value(f, *mode, *start)?;
                write!(f, " -> {end} {}, {}", mode.unit(), seconds(*duration))?;
                if let Some(skip) = skip {
                    write!(f, "; {skip}")?;
                }
                Ok(())
            }
            ProgramItem::Pin { pin, set } => {
                let verb = if *set { "Set" } else { "Clear" };
                if *pin < crate::device::settings::USER_PIN_COUNT {
                    write!(f, "{verb} pin {pin}")
                } else {
                    write!(f, "{verb} all pins")
                }
            }
        }
    }
}

/// Ordered items plus a loop count; `loops == 0` repeats forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Passes over `items`, 0 for forever.
    #[serde(default = "default_loops")]
    pub loops: u32,
    /// Steps in execution order.
    #[serde(default)]
    pub items: Vec<ProgramItem>,
}

fn default_loops() -> u32 {
    1
}

impl Default for Program {
    fn default() -> Self {
        Self {
            loops: default_loops(),
            items: Vec::new(),
        }
    }
}

impl Program {
    /// Program of `items` repeated `loops` times.
    pub fn new(items: Vec<ProgramItem>, loops: u32) -> Self {
        Self { loops, items }
    }

    /// Check every item. Fails on ramps in modes that cannot be ramped.
    pub fn validate(&self) -> LoadResult<()> {
        self.items.iter().try_for_each(ProgramItem::validate)
    }

    /// Sum of item durations for one pass.
    pub fn loop_duration(&self) -> Duration {
        self.items.iter().map(ProgramItem::duration).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn descriptions() {
        assert_eq!(
            ProgramItem::constant(RunMode::Current, Some(1.0), secs(10)).to_string(),
            "Constant current 1 A, 10 s"
        );
        assert_eq!(
            ProgramItem::constant(RunMode::PowerCv, None, Duration::from_millis(1500)).to_string(),
            "Constant power (CV, use previous), 1.5 s"
        );
        assert_eq!(
            ProgramItem::constant(RunMode::ResistanceCc, Some(4.7), secs(1)).to_string(),
            "Constant resistance (CC) 4.7 Ω, 1 s"
        );

        let ramp = ProgramItem::ramp(RunMode::Voltage, None, 5.0, secs(2)).with_skip(SkipCondition {
            quantity: Quantity::Current,
            comparison: Comparison::MoreThan,
            threshold: 2.0,
        });
        assert_eq!(
            ramp.to_string(),
            "Ramp voltage (use previous) -> 5 V, 2 s; skip if current > 2 A"
        );

        assert_eq!(ProgramItem::pin(2, true).to_string(), "Set pin 2");
        assert_eq!(ProgramItem::pin(7, false).to_string(), "Clear all pins");
    }

    #[test]
    fn ramps_reject_untracked_modes() {
        assert!(ProgramItem::ramp(RunMode::Mppt, None, 1.0, secs(1)).validate().is_err());
        assert!(ProgramItem::ramp(RunMode::PowerCc, Some(0.0), 1.0, secs(1))
            .validate()
            .is_ok());
        assert!(ProgramItem::constant(RunMode::SimpleAmmeter, None, secs(1))
            .validate()
            .is_ok());
    }

    #[test]
    fn deserializes_tagged_items() {
        let program: Program = toml::from_str(
            r#"
            loops = 3

            [[items]]
            kind = "constant"
            mode = "current"
            value = 1.5
            duration = "10s"

            [[items]]
            kind = "ramp"
            mode = "resistance_cv"
            start = 10.0
            end = 2.0
            duration = "500ms"
            skip = { quantity = "temperature", comparison = "more_than", threshold = 60.0 }

            [[items]]
            kind = "pin"
            pin = 1
            set = true
            "#,
        )
        .unwrap();

        assert_eq!(program.loops, 3);
        assert_eq!(
            program.items[0],
            ProgramItem::constant(RunMode::Current, Some(1.5), secs(10))
        );
        assert_eq!(program.items[1].duration(), Duration::from_millis(500));
        assert_eq!(
            program.items[1].skip().map(|s| s.quantity),
            Some(Quantity::Temperature)
        );
        assert_eq!(program.items[2], ProgramItem::pin(1, true));
        assert_eq!(program.loop_duration(), Duration::from_millis(10_500));
    }

    #[test]
    fn skip_condition_uses_comparator() {
        let skip = SkipCondition {
            quantity: Quantity::Voltage,
            comparison: Comparison::LessThan,
            threshold: 3.0,
        };
        assert!(skip.is_met(2.9));
        assert!(!skip.is_met(3.1));
    }
}
