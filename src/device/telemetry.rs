//! Decoded measurements.

use crate::protocol::{Quantity, RunMode, TelemetryFrame};

/// Device error bits worth reporting. Everything else is informational.
pub const REPORTABLE_ERRORS: u32 = 0x1B_F832;

/// Status byte of a telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags(u8);

impl StatusFlags {
    const CONSTANT_VOLTAGE: u8 = 1 << 0;
    const LOW_VOLTAGE_RANGE: u8 = 1 << 1;
    const LOW_CURRENT_RANGE: u8 = 1 << 2;
    const LED_ON: u8 = 1 << 3;
    const FAN_ON: u8 = 1 << 4;
    const FOUR_WIRE: u8 = 1 << 5;

    /// Wrap a raw status byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw status byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Voltage-regulating loop active.
    pub fn constant_voltage(self) -> bool {
        self.0 & Self::CONSTANT_VOLTAGE != 0
    }

    /// Voltage measured on the low range.
    pub fn low_voltage_range(self) -> bool {
        self.0 & Self::LOW_VOLTAGE_RANGE != 0
    }

    /// Current measured on the low range.
    pub fn low_current_range(self) -> bool {
        self.0 & Self::LOW_CURRENT_RANGE != 0
    }

    /// Front LED lit.
    pub fn led_on(self) -> bool {
        self.0 & Self::LED_ON != 0
    }

    /// Cooling fan running.
    pub fn fan_on(self) -> bool {
        self.0 & Self::FAN_ON != 0
    }

    /// Remote (four-wire) voltage sensing active.
    pub fn remote_sensing(self) -> bool {
        self.0 & Self::FOUR_WIRE != 0
    }
}

/// Accumulated device error bits. Bit position indexes the error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags(u32);

impl ErrorFlags {
    /// Wrap raw bits without masking.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// No error bit set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// OR in the reportable subset of `raw`.
    pub fn accumulate(&mut self, raw: u32) {
        self.0 |= raw & REPORTABLE_ERRORS;
    }

    /// Forget every bit.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Positions of the set bits, lowest first.
    pub fn active_bits(self) -> impl Iterator<Item = usize> {
        (0..32usize).filter(move |&bit| self.0 & (1u32 << bit) != 0)
    }

    /// Human-readable error list, or `None` when no bit is set.
    ///
    /// Bits without a table entry are skipped.
    pub fn describe(self, table: &[String]) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut text = String::from("Following errors were detected:");
        for bit in self.active_bits() {
            if let Some(message) = table.get(bit) {
                text.push('\n');
                text.push_str(message);
            }
        }
        Some(text)
    }
}

/// Latest measurement in SI units. All zero while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetrySample {
    /// A
    pub current: f64,
    /// V
    pub voltage: f64,
    /// °C
    pub temperature: f64,
    /// Status byte of the frame.
    pub status: StatusFlags,
}

impl TelemetrySample {
    /// Convert a decoded frame from wire units.
    pub fn from_frame(frame: &TelemetryFrame) -> Self {
        Self {
            current: f64::from(frame.current_ua) / 1e6,
            voltage: f64::from(frame.voltage_uv) / 1e6,
            temperature: f64::from(frame.temperature),
            status: StatusFlags::from_bits(frame.status),
        }
    }

    /// Dissipated power, W.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }

    /// Load resistance. With no current flowing the terminals only see the
    /// voltmeter input, so `open_circuit` is returned instead.
    pub fn resistance(&self, open_circuit: f64) -> f64 {
        if self.current == 0.0 {
            open_circuit
        } else {
            self.voltage / self.current
        }
    }

    /// Measured value of `quantity`.
    pub fn quantity(&self, quantity: Quantity, open_circuit: f64) -> f64 {
        match quantity {
            Quantity::Current => self.current,
            Quantity::Voltage => self.voltage,
            Quantity::Power => self.power(),
            Quantity::Resistance => self.resistance(open_circuit),
            Quantity::Temperature => self.temperature,
        }
    }

    /// Measured value matching the set-point unit of `mode`.
    pub fn value_for_mode(&self, mode: RunMode, open_circuit: f64) -> f64 {
        self.quantity(mode.quantity(), open_circuit)
    }
}
