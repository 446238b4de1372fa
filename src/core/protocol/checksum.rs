//! Frame checksums
//!
//! Modbus RTU uses CRC-16/Modbus (reflected polynomial 0xA001, seed 0xFFFF),
//! transmitted little-endian after the frame body.

/// CRC-16/Modbus
/// Polynomial: 0x8005 (reflected 0xA001), Init: 0xFFFF, RefIn/RefOut: true
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Append the CRC of `frame` to itself (low byte first)
pub fn append_crc16(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the trailing little-endian CRC of a complete frame.
///
/// Returns `(received, calculated)` on mismatch so callers can log both.
pub fn verify_crc16(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 2 {
        return Err((0, crc16_modbus(frame)));
    }
    let body_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let calculated = crc16_modbus(&frame[..body_len]);
    if received == calculated {
        Ok(())
    } else {
        Err((received, calculated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus() {
        // Test vector: "123456789" should give 0x4B37
        let data = b"123456789";
        assert_eq!(crc16_modbus(data), 0x4B37);
    }

    #[test]
    fn test_crc16_known_request() {
        // 01 03 00 00 00 01 -> 84 0A on the wire
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        append_crc16(&mut frame);
        assert_eq!(&frame[6..], &[0x84, 0x0A]);
    }

    #[test]
    fn test_append_then_verify() {
        for len in 0..32usize {
            let mut frame: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            append_crc16(&mut frame);
            assert!(verify_crc16(&frame).is_ok());
        }
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut frame = vec![0x11, 0x03, 0x02, 0x00, 0x2A];
        append_crc16(&mut frame);
        frame[3] ^= 0x01;
        let (received, calculated) = verify_crc16(&frame).unwrap_err();
        assert_ne!(received, calculated);
    }
}
