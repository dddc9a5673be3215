//! YMODEM batch sender (single file)
//!
//! Block 0 carries `name\0size\0`; data follows in 1024-byte STX blocks with
//! CRC-16 trailers. The batch ends with EOT and an empty block 0.

use super::xmodem::{
    build_block, finish, load_payload, send_blocks, send_with_ack, wait_start, CheckMode, TransferOptions,
    TransferSummary, CAN, CRC_REQUEST, STX,
};
use super::{param_str, ProtocolDriver, ProtocolError, ProtocolKind, RetryPolicy};
use crate::core::channel::Channel;
use crate::core::value::{Args, Value};
use std::path::Path;

/// YMODEM payload size
pub const BLOCK_SIZE: usize = 1024;

/// Header block for `name` of `size` bytes; an empty name ends the batch
pub fn header_block(name: &str, size: Option<usize>) -> Vec<u8> {
    let mut payload = Vec::new();
    if !name.is_empty() {
        payload.extend(name.bytes().filter(u8::is_ascii));
        payload.push(0);
        if let Some(size) = size {
            payload.extend_from_slice(size.to_string().as_bytes());
        }
        payload.push(0);
    }
    build_block(STX, 0, &payload, BLOCK_SIZE, 0x00, CheckMode::Crc16)
}

/// YMODEM sender
#[derive(Debug, Default)]
pub struct Ymodem;

impl Ymodem {
    /// Create a driver
    pub fn new() -> Self {
        Self
    }

    /// Run a complete single-file batch
    pub fn send(
        channel: &mut dyn Channel,
        name: &str,
        data: &[u8],
        options: &TransferOptions,
    ) -> Result<TransferSummary, ProtocolError> {
        wait_start(channel, options.start_timeout, false)?;
        tracing::info!(file = name, bytes = data.len(), "ymodem transfer started");
        let policy = RetryPolicy::new(options.retries, options.block_timeout);

        send_with_ack(channel, &header_block(name, Some(data.len())), &policy, "header block")?;
        // receiver re-requests with 'C' before the first data block
        match channel.read(1, options.block_timeout)?.first() {
            Some(&CAN) => return Err(ProtocolError::PeerCancelled),
            Some(&CRC_REQUEST) | None => {}
            Some(other) => tracing::debug!(byte = other, "unexpected byte after header block"),
        }

        let blocks = send_blocks(channel, data, STX, BLOCK_SIZE, CheckMode::Crc16, &policy)?;
        finish(channel, &policy)?;

        match send_with_ack(channel, &header_block("", None), &policy, "closing block") {
            Ok(()) => {}
            Err(ProtocolError::PeerCancelled) => return Err(ProtocolError::PeerCancelled),
            Err(e) => tracing::warn!(error = %e, "closing block not acknowledged"),
        }
        tracing::info!(blocks, "ymodem transfer complete");
        Ok(TransferSummary {
            blocks,
            bytes: data.len(),
            crc: true,
        })
    }
}

impl ProtocolDriver for Ymodem {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Ymodem
    }

    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError> {
        let options = TransferOptions::from_params(params)?;
        let (data, path) = load_payload(params)?;
        let name = param_str(params, &["name", "file_name"])
            .or_else(|| {
                path.as_deref()
                    .and_then(|p| Path::new(p).file_name())
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "data.bin".to_string());

        let summary = Self::send(channel, &name, &data, &options)?;
        let mut value = summary.to_value();
        if let Value::Map(map) = &mut value {
            map.insert("file_name".into(), Value::from(name));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::checksum::crc16_xmodem;
    use crate::core::protocol::testing::scripted;
    use crate::core::protocol::xmodem::{ACK, EOT, NAK};
    use std::time::Duration;

    fn fast() -> TransferOptions {
        TransferOptions {
            retries: 2,
            start_timeout: Duration::from_millis(100),
            block_timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_header_block() {
        let block = header_block("fw.bin", Some(2048));
        assert_eq!(block.len(), 3 + 1024 + 2);
        assert_eq!(&block[..3], &[STX, 0x00, 0xFF]);
        assert_eq!(&block[3..15], b"fw.bin\x002048\x00");
        assert!(block[15..1027].iter().all(|b| *b == 0));
        assert_eq!(&block[1027..], &crc16_xmodem(&block[3..1027]).to_be_bytes());
    }

    #[test]
    fn test_full_batch() {
        let data = vec![0xA5u8; 1500];
        // header ACK + 'C', two data blocks, EOT, closing block
        let replies = vec![vec![ACK, b'C'], vec![ACK], vec![ACK], vec![ACK], vec![ACK]];
        let (mut channel, written) = scripted(b"C", replies);
        let summary = Ymodem::send(&mut channel, "fw.bin", &data, &fast()).unwrap();
        assert_eq!(summary, TransferSummary { blocks: 2, bytes: 1500, crc: true });

        let written = written.lock();
        assert_eq!(written.len(), 5);
        assert_eq!(&written[1][..3], &[STX, 1, 0xFE]);
        assert_eq!(written[2][3 + 1500 - 1024], 0x1A);
        assert_eq!(written[3], vec![EOT]);
        assert_eq!(written[4], header_block("", None));
    }

    #[test]
    fn test_cancel_after_header_aborts() {
        let (mut channel, written) = scripted(b"C", vec![vec![ACK, CAN]]);
        let err = Ymodem::send(&mut channel, "f.bin", &[1; 10], &fast()).unwrap_err();
        assert!(matches!(err, ProtocolError::PeerCancelled));
        assert_eq!(written.lock().len(), 1);
    }

    #[test]
    fn test_missing_c_after_header_still_sends() {
        let replies = vec![vec![ACK], vec![ACK], vec![ACK], vec![ACK]];
        let (mut channel, written) = scripted(b"C", replies);
        let summary = Ymodem::send(&mut channel, "f.bin", &[7; 10], &fast()).unwrap();
        assert_eq!(summary.blocks, 1);
        assert_eq!(written.lock().len(), 4);
    }

    #[test]
    fn test_data_block_nak_exhausts_retries() {
        let replies = vec![vec![ACK, b'C'], vec![NAK], vec![NAK]];
        let (mut channel, written) = scripted(b"C", replies);
        let err = Ymodem::send(&mut channel, "f.bin", &[1; 10], &fast()).unwrap_err();
        assert!(matches!(err, ProtocolError::Checksum(_)));

        let written = written.lock();
        assert_eq!(written.len(), 3);
        assert_eq!(written[1], written[2]);
        assert_eq!(&written[1][..3], &[STX, 1, 0xFE]);
    }

    #[test]
    fn test_unacknowledged_closing_block_is_tolerated() {
        // header, one data block and EOT are ACKed; the closing block never is
        let replies = vec![vec![ACK, b'C'], vec![ACK], vec![ACK]];
        let (mut channel, written) = scripted(b"C", replies);
        let summary = Ymodem::send(&mut channel, "f.bin", &[1; 10], &fast()).unwrap();
        assert_eq!(summary, TransferSummary { blocks: 1, bytes: 10, crc: true });

        let written = written.lock();
        assert_eq!(written.len(), 5);
        assert_eq!(written[2], vec![EOT]);
        assert_eq!(written[3], header_block("", None));
        assert_eq!(written[4], header_block("", None));
    }

    #[test]
    fn test_cancel_on_closing_block_is_an_error() {
        let replies = vec![vec![ACK, b'C'], vec![ACK], vec![ACK], vec![CAN]];
        let (mut channel, _) = scripted(b"C", replies);
        let err = Ymodem::send(&mut channel, "f.bin", &[1; 10], &fast()).unwrap_err();
        assert!(matches!(err, ProtocolError::PeerCancelled));
    }

    #[test]
    fn test_nak_start_is_not_accepted() {
        let (mut channel, _) = scripted(&[NAK], vec![]);
        let err = Ymodem::send(&mut channel, "a", b"x", &fast()).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }
}
