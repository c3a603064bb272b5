//! Configuration loading using Figment.
//!
//! Configuration is read from:
//! 1. `config/mightywatt.toml` (or a path given by the caller)
//! 2. environment variables prefixed with `MIGHTYWATT_`, nested keys separated
//!    by a double underscore, e.g. `MIGHTYWATT_SERIAL__PORT=/dev/ttyACM0`
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration. The link speed and framing are fixed by the firmware and
//! are not configurable.
//!
//! # Example
//! ```no_run
//! use mightywatt::config::LoadConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoadConfig::load()?;
//! config.validate()?;
//! println!("port: {:?}", config.serial.port);
//! # Ok(())
//! # }
//! ```

use crate::device::DeviceSettings;
use crate::error::{LoadError, LoadResult};
use crate::logging::OutputFormat;
use crate::program::Program;
use crate::transport::LinkSettings;
use crate::watchdog::{ValueWatchdog, DEFAULT_SERIES_POWER_LIMIT, MIN_SERIES_POWER_LIMIT};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/mightywatt.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "MIGHTYWATT_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Name and log level.
    pub application: ApplicationConfig,
    /// Log output.
    pub logging: LoggingSection,
    /// Serial link.
    pub serial: SerialConfig,
    /// Written to the device after every connect.
    pub device: DeviceSettings,
    /// Value watchdog, armed on startup when enabled.
    pub watchdog: ValueWatchdog,
    /// Series resistor and its watchdog.
    pub series_resistance: SeriesResistanceConfig,
    /// Program run by `mightywatt run`.
    pub program: Program,
}

/// `[application]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Name shown in logs.
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "MightyWatt".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Log output options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Line format.
    pub format: OutputFormat,
    /// Log span open and close.
    pub span_events: bool,
    /// Include source file and line.
    pub file_and_line: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: OutputFormat::Pretty,
            span_events: false,
            file_and_line: false,
        }
    }
}

/// Serial link options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name such as `/dev/ttyACM0` or `COM3`.
    pub port: Option<String>,
    /// Assert DTR and RTS after opening. Needed by native USB boards
    /// (Arduino Zero style); classic boards reset on DTR and want `false`.
    pub rts_dtr: bool,
    /// Identification attempts before giving up.
    pub connect_attempts: u32,
    /// Read timeout. Expiry drops the link.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Write timeout. Expiry drops the link.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Pause after opening while the board resets.
    #[serde(with = "humantime_serde")]
    pub reset_delay: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let link = LinkSettings::default();
        Self {
            port: None,
            rts_dtr: link.rts_dtr,
            connect_attempts: 2,
            read_timeout: link.read_timeout,
            write_timeout: link.write_timeout,
            reset_delay: link.reset_delay,
        }
    }
}

/// External resistor in series with the load and its power watchdog.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesResistanceConfig {
    /// Ω; zero means no resistor.
    pub resistance: f64,
    /// W
    pub power_limit: f64,
    /// Arm the watchdog on startup.
    pub enabled: bool,
}

impl Default for SeriesResistanceConfig {
    fn default() -> Self {
        Self {
            resistance: 0.0,
            power_limit: DEFAULT_SERIES_POWER_LIMIT,
            enabled: false,
        }
    }
}

impl LoadConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> LoadResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> LoadResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(LoadError::from)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> LoadResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(LoadError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.serial.connect_attempts == 0 {
            return Err(LoadError::Configuration(
                "serial.connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.serial.read_timeout.is_zero() || self.serial.write_timeout.is_zero() {
            return Err(LoadError::Configuration(
                "serial read and write timeouts must be non-zero".to_string(),
            ));
        }

        let series = &self.series_resistance;
        if !(series.resistance >= 0.0 && series.resistance.is_finite()) {
            return Err(LoadError::Configuration(format!(
                "series_resistance.resistance must be a non-negative number, got {}",
                series.resistance
            )));
        }
        if !(series.power_limit > MIN_SERIES_POWER_LIMIT) {
            return Err(LoadError::Configuration(format!(
                "series_resistance.power_limit must exceed {MIN_SERIES_POWER_LIMIT} W, got {}",
                series.power_limit
            )));
        }

        if !self.watchdog.threshold.is_finite() {
            return Err(LoadError::Configuration(
                "watchdog.threshold must be a finite number".to_string(),
            ));
        }

        self.program.validate()
    }

    /// Link parameters for the transport.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            read_timeout: self.serial.read_timeout,
            write_timeout: self.serial.write_timeout,
            reset_delay: self.serial.reset_delay,
            rts_dtr: self.serial.rts_dtr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FanRule, LedBrightness, LedRules};
    use crate::program::ProgramItem;
    use crate::protocol::{Comparison, Quantity, RunMode};
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoadConfig::load_from(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.serial.read_timeout, Duration::from_millis(500));
        assert_eq!(config.serial.write_timeout, Duration::from_millis(400));
        assert_eq!(config.series_resistance.power_limit, 100.0);
        assert_eq!(config.device, DeviceSettings::default());
        assert!(config.program.items.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_file_is_parsed() {
        let file = write_config(
            r#"
            [application]
            name = "bench"
            log_level = "debug"

            [logging]
            format = "json"

            [serial]
            port = "/dev/ttyACM0"
            rts_dtr = true
            read_timeout = "250ms"

            [device]
            led_brightness = "high"
            led_rules = 12
            fan_rule = "auto_quiet"

            [watchdog]
            enabled = true
            quantity = "temperature"
            comparison = "more_than"
            threshold = 70.0

            [series_resistance]
            resistance = 0.5
            power_limit = 5.0
            enabled = true

            [program]
            loops = 0

            [[program.items]]
            kind = "constant"
            mode = "power_cc"
            value = 10.0
            duration = "1m"
            "#,
        );

        let config = LoadConfig::load_from(file.path()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.application.name, "bench");
        assert!(matches!(config.logging.format, OutputFormat::Json));
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.link_settings().read_timeout, Duration::from_millis(250));
        assert!(config.link_settings().rts_dtr);
        assert_eq!(config.device.led_brightness, LedBrightness::High);
        assert_eq!(config.device.led_rules, LedRules::P10 | LedRules::I1);
        assert_eq!(config.device.fan_rule, FanRule::AutoQuiet);
        assert_eq!(config.watchdog.quantity, Quantity::Temperature);
        assert_eq!(config.watchdog.comparison, Comparison::MoreThan);
        assert_eq!(config.series_resistance.power_limit, 5.0);
        assert_eq!(config.program.loops, 0);
        assert_eq!(
            config.program.items,
            vec![ProgramItem::constant(
                RunMode::PowerCc,
                Some(10.0),
                Duration::from_secs(60)
            )]
        );
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("mightywatt.toml", "[serial]\nconnect_attempts = 3\n")?;
            jail.set_env("MIGHTYWATT_SERIAL__RESET_DELAY", "750ms");
            jail.set_env("MIGHTYWATT_SERIAL__PORT", "/dev/ttyUSB1");

            let config =
                LoadConfig::load_from("mightywatt.toml").map_err(|err| err.to_string())?;
            assert_eq!(config.serial.connect_attempts, 3);
            assert_eq!(config.serial.reset_delay, Duration::from_millis(750));
            assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB1"));
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = LoadConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(LoadError::Configuration(_))
        ));

        let mut config = LoadConfig::default();
        config.series_resistance.power_limit = 0.05;
        assert!(config.validate().is_err());

        let mut config = LoadConfig::default();
        config.serial.connect_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = LoadConfig::default();
        config.program.items = vec![ProgramItem::ramp(
            RunMode::SimpleAmmeter,
            None,
            1.0,
            Duration::from_secs(1),
        )];
        assert!(matches!(
            config.validate(),
            Err(LoadError::UnsupportedMode(RunMode::SimpleAmmeter))
        ));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let file = write_config("[serial]\nread_timeout = \"soon\"\n");
        assert!(matches!(
            LoadConfig::load_from(file.path()),
            Err(LoadError::Config(_))
        ));
    }
}
