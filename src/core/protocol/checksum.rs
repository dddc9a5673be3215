//! Frame check algorithms
//!
//! Supports: CRC-16/Modbus, CRC-16/XMODEM, Modbus ASCII LRC, 8-bit sum

/// CRC-16/Modbus
/// Polynomial: 0x8005 (reflected 0xA001), Init: 0xFFFF, RefIn: true, RefOut: true
pub fn crc16_modbus(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF_u16, |mut crc, &byte| {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
        crc
    })
}

/// CRC-16/XMODEM
/// Polynomial: 0x1021, Init: 0x0000, RefIn: false, RefOut: false
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0x0000_u16, |mut crc, &byte| {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Modbus ASCII LRC: two's complement of the byte sum
pub fn lrc(data: &[u8]) -> u8 {
    sum8(data).wrapping_neg()
}

/// Simple 8-bit sum (XMODEM checksum mode)
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Append the little-endian CRC-16/Modbus trailer
pub fn append_crc16_modbus(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the little-endian CRC-16/Modbus trailer of a complete frame
pub fn verify_crc16_modbus(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    crc16_modbus(body).to_le_bytes() == trailer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus() {
        // Check value for "123456789"
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_xmodem() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_lrc_is_negated_sum() {
        let payload = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(lrc(&payload), 0xF2);
        assert_eq!(sum8(&payload).wrapping_add(lrc(&payload)), 0);
    }

    #[test]
    fn test_rtu_trailer() {
        // Read holding registers, unit 1, address 0, quantity 10
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        append_crc16_modbus(&mut frame);
        assert_eq!(&frame[6..], &[0xC5, 0xCD]);
        assert!(verify_crc16_modbus(&frame));
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let mut frame = vec![0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40];
        append_crc16_modbus(&mut frame);
        for idx in 0..frame.len() {
            for flip in [0x01u8, 0x80, 0xFF] {
                let mut corrupted = frame.clone();
                corrupted[idx] ^= flip;
                assert!(!verify_crc16_modbus(&corrupted), "byte {idx} flip {flip:#x}");
            }
        }
    }
}
