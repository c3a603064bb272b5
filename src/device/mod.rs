//! Device model and protocol engine.
//!
//! `capabilities`, `telemetry` and `settings` describe what the load reports
//! and accepts. [`Engine`] owns the link and keeps those up to date.

pub mod capabilities;
pub mod engine;
pub mod settings;
pub mod telemetry;

pub use capabilities::{DeviceCapabilities, FirmwareVersion, MINIMUM_FIRMWARE};
pub use engine::{setpoint_command, Engine, TelemetryObserver};
pub use settings::{DeviceSettings, FanRule, LedBrightness, LedRules, MeasurementFilter};
pub use telemetry::{ErrorFlags, StatusFlags, TelemetrySample};
