//! Command identifiers and the physical quantities they act on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Read commands (header direction bit clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadCommand {
    /// One 16-byte telemetry frame.
    Measurement = 1,
    /// Identification line.
    Identification = 2,
    /// Capabilities (QDC) lines.
    Capabilities = 3,
    /// Length byte followed by the error message table.
    ErrorMessages = 4,
}

/// Write commands (header direction bit set). Ids are 5 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WriteCommand {
    /// Current set-point, µA.
    ConstantCurrent = 1,
    /// Voltage set-point, µV.
    ConstantVoltage = 2,
    /// Power set-point in CC regulation, µW.
    ConstantPowerCc = 3,
    /// Power set-point in CV regulation, µW.
    ConstantPowerCv = 4,
    /// Resistance set-point in CC regulation, mΩ.
    ConstantResistanceCc = 5,
    /// Resistance set-point in CV regulation, mΩ.
    ConstantResistanceCv = 6,
    /// Voltage regulated by the firmware loop, µV.
    ConstantVoltageSoftware = 7,
    /// Maximum power point tracking, starting voltage in µV.
    Mppt = 8,
    /// Measure current only. No payload.
    SimpleAmmeter = 9,
    /// Resistance wired in series with the terminals, mΩ.
    SeriesResistance = 10,
    /// Four-wire (remote) voltage sensing on or off.
    FourWire = 11,
    /// ADC filtering, see [`MeasurementFilter`](crate::device::MeasurementFilter).
    MeasurementFilter = 12,
    /// Fan control rule.
    FanRules = 13,
    /// LED rule bitmask.
    LedRules = 14,
    /// LED brightness level.
    LedBrightness = 15,
    /// Current range autoranging on or off.
    CurrentRangeAuto = 16,
    /// Voltage range autoranging on or off.
    VoltageRangeAuto = 17,
    /// User pin state, bit 7 set drives the pin high.
    UserPins = 18,
}

impl ReadCommand {
    /// Wire id.
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl WriteCommand {
    /// Wire id.
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Regulation regime the load is commanded to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Constant current.
    Current,
    /// Constant voltage.
    Voltage,
    /// Constant power, current regulated.
    PowerCc,
    /// Constant power, voltage regulated.
    PowerCv,
    /// Constant resistance, current regulated.
    ResistanceCc,
    /// Constant resistance, voltage regulated.
    ResistanceCv,
    /// Constant voltage through the software control loop.
    VoltageSoftware,
    /// Maximum power point tracking.
    Mppt,
    /// Current measurement with the load otherwise off.
    SimpleAmmeter,
}

impl RunMode {
    /// All modes in wire order.
    pub const ALL: [RunMode; 9] = [
        RunMode::Current,
        RunMode::Voltage,
        RunMode::PowerCc,
        RunMode::PowerCv,
        RunMode::ResistanceCc,
        RunMode::ResistanceCv,
        RunMode::VoltageSoftware,
        RunMode::Mppt,
        RunMode::SimpleAmmeter,
    ];

    /// Write command that puts the load into this mode.
    pub fn write_command(self) -> WriteCommand {
        match self {
            RunMode::Current => WriteCommand::ConstantCurrent,
            RunMode::Voltage => WriteCommand::ConstantVoltage,
            RunMode::PowerCc => WriteCommand::ConstantPowerCc,
            RunMode::PowerCv => WriteCommand::ConstantPowerCv,
            RunMode::ResistanceCc => WriteCommand::ConstantResistanceCc,
            RunMode::ResistanceCv => WriteCommand::ConstantResistanceCv,
            RunMode::VoltageSoftware => WriteCommand::ConstantVoltageSoftware,
            RunMode::Mppt => WriteCommand::Mppt,
            RunMode::SimpleAmmeter => WriteCommand::SimpleAmmeter,
        }
    }

    /// Multiplier from SI units to the wire integer.
    ///
    /// Resistance travels in mΩ, everything else in µ-units.
    pub fn wire_scale(self) -> f64 {
        match self {
            RunMode::ResistanceCc | RunMode::ResistanceCv => 1_000.0,
            _ => 1_000_000.0,
        }
    }

    /// Whether a set-point in this mode carries a value.
    pub fn has_setpoint(self) -> bool {
        !matches!(self, RunMode::SimpleAmmeter)
    }

    /// Quantity read back when a program item "uses the previous value".
    pub fn quantity(self) -> Quantity {
        match self {
            RunMode::Current | RunMode::SimpleAmmeter => Quantity::Current,
            RunMode::PowerCc | RunMode::PowerCv => Quantity::Power,
            RunMode::ResistanceCc | RunMode::ResistanceCv => Quantity::Resistance,
            RunMode::Voltage | RunMode::VoltageSoftware | RunMode::Mppt => Quantity::Voltage,
        }
    }

    /// Unit symbol of the set-point.
    pub fn unit(self) -> &'static str {
        match self {
            RunMode::SimpleAmmeter => "",
            other => other.quantity().unit(),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Current => "current",
            RunMode::Voltage => "voltage",
            RunMode::PowerCc => "power (CC)",
            RunMode::PowerCv => "power (CV)",
            RunMode::ResistanceCc => "resistance (CC)",
            RunMode::ResistanceCv => "resistance (CV)",
            RunMode::VoltageSoftware => "SW controlled voltage",
            RunMode::Mppt => "maximum power point tracker",
            RunMode::SimpleAmmeter => "simple ammeter",
        };
        f.write_str(name)
    }
}

/// Measured quantity monitored by skip conditions and watchdogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Current, A.
    Current,
    /// Voltage, V.
    Voltage,
    /// Power, W.
    Power,
    /// Voltage over current, Ω.
    Resistance,
    /// Heatsink temperature, °C.
    Temperature,
}

impl Quantity {
    /// Unit symbol.
    pub fn unit(self) -> &'static str {
        match self {
            Quantity::Current => "A",
            Quantity::Voltage => "V",
            Quantity::Power => "W",
            Quantity::Resistance => "Ω",
            Quantity::Temperature => "°C",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Current => "current",
            Quantity::Voltage => "voltage",
            Quantity::Power => "power",
            Quantity::Resistance => "resistance",
            Quantity::Temperature => "temperature",
        };
        f.write_str(name)
    }
}

/// Threshold comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Trigger below the threshold.
    LessThan,
    /// Trigger above the threshold.
    MoreThan,
}

impl Comparison {
    /// True when `measured` is on the triggering side of `threshold`.
    ///
    /// Equality never triggers `LessThan` but does trigger `MoreThan`, which is
    /// how the device software has always compared.
    pub fn holds(self, measured: f64, threshold: f64) -> bool {
        (self == Comparison::LessThan) == (measured < threshold)
    }

    /// Symbol used in descriptions.
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::LessThan => "<",
            Comparison::MoreThan => ">",
        }
    }
}
