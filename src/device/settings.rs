//! Front-panel and measurement settings written with single-byte commands.

use crate::protocol::{OutboundCommand, Payload, WriteCommand};
use serde::{Deserialize, Serialize};

/// Number of user-controlled digital pins (Arduino 2, 6, 7, 10, 13).
pub const USER_PIN_COUNT: u8 = 5;

/// Payload that drives every user pin low.
pub const RESET_USER_PINS: u8 = 0x7F;

const PIN_SET_FLAG: u8 = 0x80;

/// LED brightness presets, gamma corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedBrightness {
    /// LED always dark.
    Off,
    /// Dim.
    Low,
    /// Default.
    #[default]
    Medium,
    /// Full brightness.
    High,
}

impl LedBrightness {
    /// PWM level written to the device.
    pub fn level(self) -> u8 {
        match self {
            LedBrightness::Off => 0,
            LedBrightness::Low => 23,
            LedBrightness::Medium => 105,
            LedBrightness::High => 255,
        }
    }
}

/// Bitmask of conditions that light the LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedRules(pub u8);

impl LedRules {
    /// Never lit.
    pub const ALWAYS_OFF: LedRules = LedRules(0);
    /// P > 1 W
    pub const P1: LedRules = LedRules(1);
    /// V > 1 V
    pub const V1: LedRules = LedRules(2);
    /// I > 1 A
    pub const I1: LedRules = LedRules(4);
    /// P > 10 W
    pub const P10: LedRules = LedRules(8);
    /// V > 10 V
    pub const V10: LedRules = LedRules(16);
    /// I > 10 A
    pub const I10: LedRules = LedRules(32);
    /// T > 50 °C
    pub const T50: LedRules = LedRules(64);
    /// Always lit.
    pub const ALWAYS_ON: LedRules = LedRules(128);

    /// True if every bit of `other` is set.
    pub fn contains(self, other: LedRules) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for LedRules {
    fn default() -> Self {
        LedRules::I1
    }
}

impl std::ops::BitOr for LedRules {
    type Output = LedRules;

    fn bitor(self, rhs: LedRules) -> LedRules {
        LedRules(self.0 | rhs.0)
    }
}

/// When the cooling fan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanRule {
    /// Fan always on.
    #[default]
    AlwaysOn,
    /// Temperature controlled, biased towards cooling.
    AutoCool,
    /// Temperature controlled, biased towards silence.
    AutoQuiet,
}

impl FanRule {
    /// Wire value.
    pub fn code(self) -> u8 {
        match self {
            FanRule::AlwaysOn => 0,
            FanRule::AutoCool => 1,
            FanRule::AutoQuiet => 2,
        }
    }
}

/// ADC filtering and range selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementFilter {
    /// Raw samples, fixed ADC range.
    UnfilteredNoAdcAutoranging,
    /// Raw samples.
    Unfiltered,
    /// Averaged samples.
    #[default]
    Filtered,
}

impl MeasurementFilter {
    /// Wire value.
    pub fn code(self) -> u8 {
        match self {
            MeasurementFilter::UnfilteredNoAdcAutoranging => 0,
            MeasurementFilter::Unfiltered => 1,
            MeasurementFilter::Filtered => 2,
        }
    }
}

/// Settings pushed to the device after every successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// LED brightness.
    pub led_brightness: LedBrightness,
    /// Conditions that light the LED.
    pub led_rules: LedRules,
    /// Fan control.
    pub fan_rule: FanRule,
    /// ADC filtering.
    pub measurement_filter: MeasurementFilter,
    /// Automatic current range switching.
    pub autorange_current: bool,
    /// Automatic voltage range switching.
    pub autorange_voltage: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            led_brightness: LedBrightness::default(),
            led_rules: LedRules::default(),
            fan_rule: FanRule::default(),
            measurement_filter: MeasurementFilter::default(),
            autorange_current: true,
            autorange_voltage: true,
        }
    }
}

impl DeviceSettings {
    /// Commands that apply every setting, in the order the device expects them.
    pub fn commands(&self) -> [OutboundCommand; 6] {
        [
            led_brightness_command(self.led_brightness),
            led_rules_command(self.led_rules),
            fan_rule_command(self.fan_rule),
            measurement_filter_command(self.measurement_filter),
            autorange_command(WriteCommand::CurrentRangeAuto, self.autorange_current),
            autorange_command(WriteCommand::VoltageRangeAuto, self.autorange_voltage),
        ]
    }
}

/// Set the LED brightness.
pub fn led_brightness_command(brightness: LedBrightness) -> OutboundCommand {
    OutboundCommand::write(WriteCommand::LedBrightness, Payload::U8(brightness.level()))
}

/// Set the LED rules.
pub fn led_rules_command(rules: LedRules) -> OutboundCommand {
    OutboundCommand::write(WriteCommand::LedRules, Payload::U8(rules.0))
}

/// Set the fan rule.
pub fn fan_rule_command(rule: FanRule) -> OutboundCommand {
    OutboundCommand::write(WriteCommand::FanRules, Payload::U8(rule.code()))
}

/// Set the measurement filter.
pub fn measurement_filter_command(filter: MeasurementFilter) -> OutboundCommand {
    OutboundCommand::write(WriteCommand::MeasurementFilter, Payload::U8(filter.code()))
}

/// `command` must be one of the two autoranging commands.
pub fn autorange_command(command: WriteCommand, enabled: bool) -> OutboundCommand {
    OutboundCommand::write(command, Payload::U8(u8::from(enabled)))
}

/// Enable or disable four-wire sensing.
pub fn remote_sensing_command(enabled: bool) -> OutboundCommand {
    OutboundCommand::write(WriteCommand::FourWire, Payload::U8(u8::from(enabled)))
}

/// Series resistance travels in mΩ.
pub fn series_resistance_command(ohms: f64) -> OutboundCommand {
    let milliohms = (ohms * 1000.0).round().clamp(0.0, f64::from(u32::MAX)) as u32;
    OutboundCommand::write(WriteCommand::SeriesResistance, Payload::U32(milliohms))
}

/// Bits addressed by `pin`. Indices past the last pin address all of them.
pub fn pin_mask(pin: u8) -> u8 {
    if pin < USER_PIN_COUNT {
        1 << pin
    } else {
        (1 << USER_PIN_COUNT) - 1
    }
}

/// Drive `pin` high (`set`) or low.
pub fn user_pin_command(pin: u8, set: bool) -> OutboundCommand {
    let mut payload = pin_mask(pin);
    if set {
        payload |= PIN_SET_FLAG;
    }
    OutboundCommand::write(WriteCommand::UserPins, Payload::U8(payload))
}

/// Drive all user pins low.
pub fn reset_user_pins_command() -> OutboundCommand {
    OutboundCommand::write(WriteCommand::UserPins, Payload::U8(RESET_USER_PINS))
}
