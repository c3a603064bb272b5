//! MightyWatt R3 wire protocol.
//!
//! Pure encoding and decoding; nothing in here touches I/O.

pub mod commands;
pub mod crc;
pub mod frame;

pub use commands::{Comparison, Quantity, ReadCommand, RunMode, WriteCommand};
pub use frame::{CrcMismatch, OutboundCommand, Payload, TelemetryFrame, TELEMETRY_FRAME_LEN};

/// Link speed fixed by the firmware.
pub const BAUD_RATE: u32 = 500_000;

/// Line terminator of text responses.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Substring the identification response must contain.
pub const IDENTIFICATION: &str = "MightyWatt R3";
