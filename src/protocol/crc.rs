//! CRC16/CCITT as used on the MightyWatt link.
//!
//! Polynomial 0x1021, initial value 0, MSB first, no reflection and no final
//! XOR. In the `crc` catalogue this is `CRC_16_XMODEM`.

use crc::{Crc, CRC_16_XMODEM};

/// CRC polynomial shared with the firmware.
pub const CRC_POLYNOMIAL: u16 = 0x1021;

/// Number of CRC bytes appended to every frame.
pub const CRC_LENGTH: usize = 2;

const CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the CRC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CCITT.checksum(data)
}

/// Append the little-endian CRC of the current contents to `frame`.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a buffer whose last two bytes are a little-endian CRC over the rest.
pub fn verify_trailing_crc(frame: &[u8]) -> bool {
    if frame.len() < CRC_LENGTH {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - CRC_LENGTH);
    u16::from_le_bytes([tail[0], tail[1]]) == crc16(body)
}
