//! Binary frame codec.
//!
//! Outbound frames are a single header byte, an optional little-endian payload
//! of 1, 2 or 4 bytes and a trailing CRC:
//!
//! ```text
//!   bit 7      direction (0 = read, 1 = write)
//!   bits 6-5   payload length class, index into {0, 1, 2, 4}
//!   bits 4-0   command id
//! ```
//!
//! Inbound telemetry is a fixed 16-byte frame:
//!
//! ```text
//!   [0..4)   current, µA, u32 LE
//!   [4..8)   voltage, µV, u32 LE
//!   [8]      temperature, °C
//!   [9]      status bits
//!   [10..14) error flags, u32 LE
//!   [14..16) CRC over bytes 0..14, LE
//! ```

use super::commands::{ReadCommand, WriteCommand};
use super::crc::{append_crc, crc16, CRC_LENGTH};
use thiserror::Error;

/// Size of a telemetry frame on the wire.
pub const TELEMETRY_FRAME_LEN: usize = 16;

const WRITE_FLAG: u8 = 0x80;
const COMMAND_ID_MASK: u8 = 0x1F;
const LENGTH_CLASS_SHIFT: u8 = 5;

/// Payload of an outbound command. The variant selects the length class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// No payload bytes.
    Empty,
    /// One byte.
    U8(u8),
    /// Two bytes, little-endian.
    U16(u16),
    /// Four bytes, little-endian.
    U32(u32),
}

impl Payload {
    /// Number of payload bytes on the wire.
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::U8(_) => 1,
            Payload::U16(_) => 2,
            Payload::U32(_) => 4,
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    /// Two-bit index into the length table {0, 1, 2, 4}.
    fn length_class(&self) -> u8 {
        match self {
            Payload::Empty => 0,
            Payload::U8(_) => 1,
            Payload::U16(_) => 2,
            Payload::U32(_) => 3,
        }
    }

    fn write_into(&self, buf: &mut Vec<u8>) {
        match *self {
            Payload::Empty => {}
            Payload::U8(v) => buf.push(v),
            Payload::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Payload::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// One command waiting in the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundCommand {
    write: bool,
    command_id: u8,
    payload: Payload,
}

impl OutboundCommand {
    /// A read request. Reads never carry a payload.
    pub fn read(command: ReadCommand) -> Self {
        Self {
            write: false,
            command_id: command.id(),
            payload: Payload::Empty,
        }
    }

    /// A write command with the given payload.
    pub fn write(command: WriteCommand, payload: Payload) -> Self {
        Self {
            write: true,
            command_id: command.id(),
            payload,
        }
    }

    /// Whether this is a write command.
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Raw 5-bit command id.
    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    /// Payload carried by the command.
    pub fn payload(&self) -> Payload {
        self.payload
    }

    /// Header byte.
    pub fn header(&self) -> u8 {
        let direction = if self.write { WRITE_FLAG } else { 0 };
        direction
            | (self.payload.length_class() << LENGTH_CLASS_SHIFT)
            | (self.command_id & COMMAND_ID_MASK)
    }

    /// Full wire frame: header, payload, CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.payload.len() + CRC_LENGTH);
        frame.push(self.header());
        self.payload.write_into(&mut frame);
        append_crc(&mut frame);
        frame
    }
}

/// Raw contents of a telemetry frame, still in wire units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryFrame {
    /// Current in µA.
    pub current_ua: u32,
    /// Voltage in µV.
    pub voltage_uv: u32,
    /// Temperature in whole °C.
    pub temperature: u8,
    /// Status byte.
    pub status: u8,
    /// Unmasked error flags.
    pub error_flags: u32,
}

/// A telemetry frame whose CRC did not match its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("telemetry CRC mismatch: received {received:#06x}, computed {computed:#06x}")]
pub struct CrcMismatch {
    /// CRC carried by the frame.
    pub received: u16,
    /// CRC computed over the frame body.
    pub computed: u16,
}

impl TelemetryFrame {
    /// Decode a 16-byte frame, rejecting it if the CRC does not match.
    pub fn decode(bytes: &[u8; TELEMETRY_FRAME_LEN]) -> Result<Self, CrcMismatch> {
        let body = &bytes[..TELEMETRY_FRAME_LEN - CRC_LENGTH];
        let received = u16::from_le_bytes([bytes[14], bytes[15]]);
        let computed = crc16(body);
        if received != computed {
            return Err(CrcMismatch { received, computed });
        }

        Ok(Self {
            current_ua: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            voltage_uv: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            temperature: bytes[8],
            status: bytes[9],
            error_flags: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
        })
    }

    /// Encode into wire form. The device side of the link uses this; the
    /// host only ever decodes.
    pub fn encode(&self) -> [u8; TELEMETRY_FRAME_LEN] {
        let mut out = [0u8; TELEMETRY_FRAME_LEN];
        out[0..4].copy_from_slice(&self.current_ua.to_le_bytes());
        out[4..8].copy_from_slice(&self.voltage_uv.to_le_bytes());
        out[8] = self.temperature;
        out[9] = self.status;
        out[10..14].copy_from_slice(&self.error_flags.to_le_bytes());
        let crc = crc16(&out[..14]);
        out[14..16].copy_from_slice(&crc.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::verify_trailing_crc;

    #[test]
    fn read_header_has_no_payload() {
        let cmd = OutboundCommand::read(ReadCommand::Measurement);
        assert_eq!(cmd.header(), 0x01);
        let frame = cmd.encode();
        assert_eq!(frame.len(), 3);
        assert!(verify_trailing_crc(&frame));
    }

    #[test]
    fn write_header_encodes_length_class() {
        let one = OutboundCommand::write(WriteCommand::FourWire, Payload::U8(1));
        assert_eq!(one.header(), 0x80 | (1 << 5) | 11);

        let two = OutboundCommand::write(WriteCommand::LedRules, Payload::U16(0x0102));
        assert_eq!(two.header(), 0x80 | (2 << 5) | 14);

        let four = OutboundCommand::write(WriteCommand::ConstantCurrent, Payload::U32(0));
        assert_eq!(four.header(), 0x80 | (3 << 5) | 1);
        assert_eq!(four.header(), 0xE1);
    }

    #[test]
    fn payload_is_little_endian() {
        let cmd = OutboundCommand::write(WriteCommand::ConstantCurrent, Payload::U32(1_500_000));
        let frame = cmd.encode();
        assert_eq!(frame.len(), 7);
        assert_eq!(&frame[1..5], &1_500_000u32.to_le_bytes());
        assert!(verify_trailing_crc(&frame));
    }

    #[test]
    fn telemetry_decodes_wire_units() {
        let raw = TelemetryFrame {
            current_ua: 1_234_567,
            voltage_uv: 12_000_001,
            temperature: 41,
            status: 0b0010_0001,
            error_flags: 0x0000_0010,
        };
        let bytes = raw.encode();
        assert_eq!(&bytes[0..4], &[0x87, 0xD6, 0x12, 0x00]);
        let decoded = TelemetryFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn corrupted_telemetry_is_rejected() {
        let mut bytes = TelemetryFrame {
            current_ua: 5,
            ..Default::default()
        }
        .encode();
        bytes[3] ^= 0x40;
        let err = TelemetryFrame::decode(&bytes).unwrap_err();
        assert_ne!(err.received, err.computed);
    }
}
