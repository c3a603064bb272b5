//! Device limits and calibration metadata reported by the QDC query.

use crate::error::{LoadError, LoadResult};
use crate::protocol::RunMode;
use std::fmt;
use std::str::FromStr;

/// Oldest firmware this crate was verified against.
pub const MINIMUM_FIRMWARE: FirmwareVersion = FirmwareVersion::new(3, 1, 4);

/// Number of lines in a QDC response.
pub const QDC_LINE_COUNT: usize = 10;

/// `major.minor.patch`, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch level.
    pub patch: u32,
}

impl FirmwareVersion {
    /// Version from its parts.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = LoadError;

    /// Parses the first three dot-separated components; anything after is
    /// ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |name: &str| -> LoadResult<u32> {
            parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| LoadError::Protocol(format!("firmware version {s:?} has no {name}")))
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        })
    }
}

/// Limits of the connected load, in SI units.
///
/// Filled once per connection and replaced wholesale on reconnect. The default
/// value (all zero) stands for "nothing connected".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceCapabilities {
    /// Calibration date as printed by the device.
    pub calibration_date: String,
    /// Firmware version exactly as reported.
    pub firmware: String,
    /// Hardware revision letter.
    pub board_revision: String,
    /// Current DAC full scale, A.
    pub max_idac: f64,
    /// Current ADC full scale, A.
    pub max_iadc: f64,
    /// Voltage DAC full scale, V.
    pub max_vdac: f64,
    /// Voltage ADC full scale, V.
    pub max_vadc: f64,
    /// Power limit, W.
    pub max_power: f64,
    /// Differential voltmeter input resistance, Ω.
    pub dvm_input_resistance: f64,
    /// Overtemperature threshold, °C.
    pub temperature_threshold: i32,
}

impl DeviceCapabilities {
    /// Parse the ten QDC lines in device order. Currents, voltages and power
    /// arrive in µ-units, the DVM resistance in mΩ.
    pub fn from_qdc_lines<S: AsRef<str>>(lines: &[S]) -> LoadResult<Self> {
        if lines.len() < QDC_LINE_COUNT {
            return Err(LoadError::Protocol(format!(
                "capabilities response has {} lines, expected {QDC_LINE_COUNT}",
                lines.len()
            )));
        }
        let text = |i: usize| lines[i].as_ref().trim().to_string();
        let micro = |i: usize| parse_number(lines[i].as_ref(), i).map(|v| v / 1e6);

        Ok(Self {
            calibration_date: text(0),
            firmware: text(1),
            board_revision: text(2),
            max_idac: micro(3)?,
            max_iadc: micro(4)?,
            max_vdac: micro(5)?,
            max_vadc: micro(6)?,
            max_power: micro(7)?,
            dvm_input_resistance: parse_number(lines[8].as_ref(), 8)? / 1000.0,
            temperature_threshold: lines[9].as_ref().trim().parse().map_err(|_| {
                LoadError::Protocol(format!(
                    "temperature threshold {:?} is not an integer",
                    lines[9].as_ref()
                ))
            })?,
        })
    }

    /// Parsed firmware version, if the device reported one.
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.firmware.parse().ok()
    }

    /// Warning to surface when the firmware is older than supported or
    /// unreadable. `None` means the firmware is fine.
    pub fn firmware_warning(&self) -> Option<String> {
        match self.firmware_version() {
            Some(version) if version >= MINIMUM_FIRMWARE => None,
            Some(version) => Some(format!(
                "Firmware version {version} is lower than the minimum required version {MINIMUM_FIRMWARE}"
            )),
            None => Some("The load did not report its firmware version".to_string()),
        }
    }

    /// Largest current that can be both set and measured.
    pub fn max_current(&self) -> f64 {
        self.max_iadc.min(self.max_idac)
    }

    /// Largest voltage that can be both set and measured.
    pub fn max_voltage(&self) -> f64 {
        self.max_vadc.min(self.max_vdac)
    }

    /// Upper set-point bound for `mode`. `None` for modes without a set-point.
    pub fn limit_for(&self, mode: RunMode) -> Option<f64> {
        match mode {
            RunMode::Current => Some(self.max_current()),
            RunMode::Voltage | RunMode::Mppt => Some(self.max_voltage()),
            // Regulated in software against the measured value only.
            RunMode::VoltageSoftware => Some(self.max_vadc),
            RunMode::PowerCc | RunMode::PowerCv => Some(self.max_power),
            RunMode::ResistanceCc | RunMode::ResistanceCv => Some(self.dvm_input_resistance),
            RunMode::SimpleAmmeter => None,
        }
    }
}

fn parse_number(line: &str, index: usize) -> LoadResult<f64> {
    line.trim().parse().map_err(|_| {
        LoadError::Protocol(format!(
            "capabilities line {index} ({line:?}) is not a number"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const QDC: &str =
        "2024-01-01\n3.1.4\nB\n10000000\n10000000\n60000000\n60000000\n300000000\n1000000\n85";

    fn sample() -> DeviceCapabilities {
        let lines: Vec<&str> = QDC.lines().collect();
        DeviceCapabilities::from_qdc_lines(&lines).unwrap()
    }

    #[test]
    fn parses_reference_response() {
        let caps = sample();
        assert_eq!(caps.calibration_date, "2024-01-01");
        assert_eq!(caps.board_revision, "B");
        assert_eq!(caps.max_idac, 10.0);
        assert_eq!(caps.max_vadc, 60.0);
        assert_eq!(caps.max_power, 300.0);
        assert_eq!(caps.dvm_input_resistance, 1000.0);
        assert_eq!(caps.temperature_threshold, 85);
        assert_eq!(caps.firmware_version(), Some(FirmwareVersion::new(3, 1, 4)));
        assert!(caps.firmware_warning().is_none());
    }

    #[test]
    fn firmware_ordering_is_lexicographic() {
        let v = |s: &str| s.parse::<FirmwareVersion>().unwrap();
        assert!(v("3.1.3") < MINIMUM_FIRMWARE);
        assert!(v("3.0.99") < MINIMUM_FIRMWARE);
        assert!(v("2.9.9") < MINIMUM_FIRMWARE);
        assert!(v("3.2.0") > MINIMUM_FIRMWARE);
        assert!(v("4.0.0") > MINIMUM_FIRMWARE);
        assert_eq!(v("3.1.4.1"), MINIMUM_FIRMWARE);
        assert!("3.1".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn old_or_missing_firmware_warns() {
        let mut caps = sample();
        caps.firmware = "3.0.0".into();
        assert!(caps.firmware_warning().unwrap().contains("3.0.0"));
        caps.firmware = "unknown".into();
        assert!(caps.firmware_warning().unwrap().contains("did not report"));
    }

    #[test]
    fn limits_follow_modes() {
        let mut caps = sample();
        caps.max_iadc = 9.5;
        caps.max_vdac = 30.0;
        assert_eq!(caps.limit_for(RunMode::Current), Some(9.5));
        assert_eq!(caps.limit_for(RunMode::Voltage), Some(30.0));
        assert_eq!(caps.limit_for(RunMode::Mppt), Some(30.0));
        assert_eq!(caps.limit_for(RunMode::VoltageSoftware), Some(60.0));
        assert_eq!(caps.limit_for(RunMode::PowerCv), Some(300.0));
        assert_eq!(caps.limit_for(RunMode::ResistanceCc), Some(1000.0));
        assert_eq!(caps.limit_for(RunMode::SimpleAmmeter), None);
    }

    #[test]
    fn malformed_lines_are_protocol_errors() {
        let short = ["2024-01-01", "3.1.4"];
        assert!(matches!(
            DeviceCapabilities::from_qdc_lines(&short),
            Err(LoadError::Protocol(_))
        ));

        let mut lines: Vec<&str> = QDC.lines().collect();
        lines[4] = "ten";
        let err = DeviceCapabilities::from_qdc_lines(&lines).unwrap_err();
        assert!(err.to_string().contains("line 4"));
    }
}
