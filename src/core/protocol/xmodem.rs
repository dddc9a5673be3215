//! XMODEM sender
//!
//! Supports:
//! - XMODEM-CRC (receiver starts with 'C')
//! - XMODEM checksum (receiver starts with NAK)
//!
//! The block and handshake helpers are shared with YMODEM and with the
//! single-step `send_xmodem_block` action.

use super::checksum::{crc16_xmodem, sum8};
use super::{invalid, param, param_duration_ms, param_int, ProtocolDriver, ProtocolError, ProtocolKind, RetryPolicy};
use crate::core::channel::Channel;
use crate::core::value::{Args, Value};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

/// Start of 128-byte block
pub const SOH: u8 = 0x01;
/// Start of 1024-byte block
pub const STX: u8 = 0x02;
/// End of transmission
pub const EOT: u8 = 0x04;
/// Acknowledge
pub const ACK: u8 = 0x06;
/// Negative acknowledge
pub const NAK: u8 = 0x15;
/// Cancel
pub const CAN: u8 = 0x18;
/// CRC mode request
pub const CRC_REQUEST: u8 = b'C';
/// Data padding (Ctrl-Z)
pub const SUB: u8 = 0x1A;
/// XMODEM payload size
pub const BLOCK_SIZE: usize = 128;

/// Block trailer selected by the receiver's start byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Big-endian CRC-16/XMODEM
    Crc16,
    /// 8-bit arithmetic sum
    Checksum,
}

/// Timing and retry parameters for a transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferOptions {
    /// Attempts per block and for the EOT handshake
    pub retries: u32,
    /// How long to wait for the receiver's start byte
    pub start_timeout: Duration,
    /// How long to wait for each ACK
    pub block_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            start_timeout: Duration::from_secs(10),
            block_timeout: Duration::from_secs(1),
        }
    }
}

impl TransferOptions {
    /// Read `retries`, `start_timeout` and `block_timeout` (ms) from params
    pub fn from_params(params: &Args) -> Result<Self, ProtocolError> {
        let defaults = Self::default();
        let retries = match param_int(params, &["retries"])? {
            Some(n) => u32::try_from(n).map_err(|_| invalid("retries must be >= 0"))?,
            None => defaults.retries,
        };
        Ok(Self {
            retries,
            start_timeout: param_duration_ms(params, &["start_timeout"])?.unwrap_or(defaults.start_timeout),
            block_timeout: param_duration_ms(params, &["block_timeout"])?.unwrap_or(defaults.block_timeout),
        })
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, self.block_timeout)
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    /// Data blocks sent
    pub blocks: usize,
    /// File bytes sent (before padding)
    pub bytes: usize,
    /// Whether CRC mode was negotiated
    pub crc: bool,
}

impl TransferSummary {
    /// Script-facing result map
    pub fn to_value(&self) -> Value {
        Value::map([
            ("blocks", Value::from(self.blocks)),
            ("bytes", Value::from(self.bytes)),
            ("crc", Value::Bool(self.crc)),
        ])
    }
}

/// Frame one block: header, number, complement, padded payload, trailer
pub fn build_block(header: u8, block_no: u8, data: &[u8], size: usize, pad: u8, mode: CheckMode) -> Vec<u8> {
    let mut payload = data[..data.len().min(size)].to_vec();
    payload.resize(size, pad);

    let mut packet = Vec::with_capacity(size + 5);
    packet.push(header);
    packet.push(block_no);
    packet.push(!block_no);
    packet.extend_from_slice(&payload);
    match mode {
        CheckMode::Crc16 => packet.extend_from_slice(&crc16_xmodem(&payload).to_be_bytes()),
        CheckMode::Checksum => packet.push(sum8(&payload)),
    }
    packet
}

/// Wait for the receiver's start byte; NAK is only honoured when `allow_checksum`
pub fn wait_start(channel: &mut dyn Channel, timeout: Duration, allow_checksum: bool) -> Result<CheckMode, ProtocolError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProtocolError::Timeout(format!("no start handshake within {timeout:?}")));
        }
        let byte = channel.read(1, remaining.min(Duration::from_millis(500)))?;
        match byte.first() {
            Some(&CRC_REQUEST) => return Ok(CheckMode::Crc16),
            Some(&NAK) if allow_checksum => return Ok(CheckMode::Checksum),
            Some(&CAN) => return Err(ProtocolError::PeerCancelled),
            Some(other) => tracing::trace!(byte = other, "ignoring byte while waiting for start"),
            None => {}
        }
    }
}

/// Write `packet` until the receiver ACKs it
pub fn send_with_ack(channel: &mut dyn Channel, packet: &[u8], policy: &RetryPolicy, label: &str) -> Result<(), ProtocolError> {
    policy.run(label, |_| {
        channel.write(packet)?;
        let reply = channel.read(1, policy.timeout)?;
        match reply.first() {
            Some(&ACK) => Ok(()),
            Some(&CAN) => Err(ProtocolError::PeerCancelled),
            Some(&NAK) => Err(ProtocolError::Checksum(format!("{label}: receiver sent NAK"))),
            Some(other) => Err(ProtocolError::Framing(format!("{label}: unexpected reply {other:#04x}"))),
            None => Err(ProtocolError::Timeout(format!("{label}: no ACK within {:?}", policy.timeout))),
        }
    })
}

/// Send EOT until acknowledged
pub fn finish(channel: &mut dyn Channel, policy: &RetryPolicy) -> Result<(), ProtocolError> {
    send_with_ack(channel, &[EOT], policy, "EOT")
}

/// Send `data` as consecutive blocks numbered from 1 (wrapping 255 -> 0)
pub(crate) fn send_blocks(
    channel: &mut dyn Channel,
    data: &[u8],
    header: u8,
    size: usize,
    mode: CheckMode,
    policy: &RetryPolicy,
) -> Result<usize, ProtocolError> {
    let mut block_no: u8 = 1;
    let mut blocks = 0;
    for chunk in data.chunks(size) {
        let packet = build_block(header, block_no, chunk, size, SUB, mode);
        send_with_ack(channel, &packet, policy, &format!("block {}", blocks + 1))?;
        tracing::trace!(block = blocks + 1, number = block_no, "block acknowledged");
        block_no = block_no.wrapping_add(1);
        blocks += 1;
    }
    Ok(blocks)
}

/// Read block `block_no` (1-based) of `size` bytes, padded with [`SUB`]
pub fn read_block(path: &Path, block_no: u64, size: usize) -> Result<Vec<u8>, ProtocolError> {
    if block_no == 0 {
        return Err(invalid("block numbers start at 1"));
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start((block_no - 1) * size as u64))?;
    let mut data = Vec::with_capacity(size);
    file.take(size as u64).read_to_end(&mut data)?;
    data.resize(size, SUB);
    Ok(data)
}

/// Number of `size`-byte blocks needed for `len` bytes
pub fn block_count(len: u64, size: usize) -> u64 {
    len.div_ceil(size as u64)
}

/// Load the transfer payload from `file`/`path`, or inline `data`
pub(crate) fn load_payload(params: &Args) -> Result<(Vec<u8>, Option<String>), ProtocolError> {
    if let Some(path) = param(params, &["file", "path", "file_path"]) {
        let path = path.to_string();
        let data = std::fs::read(&path)?;
        return Ok((data, Some(path)));
    }
    match param(params, &["data"]) {
        Some(value) => value
            .to_bytes()
            .map(|b| (b, None))
            .ok_or_else(|| invalid("data must be bytes or text")),
        None => Err(invalid("a file path is required")),
    }
}

/// XMODEM (128-byte) sender
#[derive(Debug, Default)]
pub struct Xmodem;

impl Xmodem {
    /// Create a driver
    pub fn new() -> Self {
        Self
    }

    /// Run a complete transfer of `data`
    pub fn send(channel: &mut dyn Channel, data: &[u8], options: &TransferOptions) -> Result<TransferSummary, ProtocolError> {
        let mode = wait_start(channel, options.start_timeout, true)?;
        tracing::info!(?mode, bytes = data.len(), "xmodem transfer started");
        let policy = options.policy();
        let blocks = send_blocks(channel, data, SOH, BLOCK_SIZE, mode, &policy)?;
        finish(channel, &policy)?;
        tracing::info!(blocks, "xmodem transfer complete");
        Ok(TransferSummary {
            blocks,
            bytes: data.len(),
            crc: mode == CheckMode::Crc16,
        })
    }
}

impl ProtocolDriver for Xmodem {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Xmodem
    }

    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError> {
        let options = TransferOptions::from_params(params)?;
        let (data, _) = load_payload(params)?;
        Ok(Self::send(channel, &data, &options)?.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::testing::scripted;

    fn fast() -> TransferOptions {
        TransferOptions {
            retries: 3,
            start_timeout: Duration::from_millis(100),
            block_timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_block_layout() {
        let packet = build_block(SOH, 1, b"hello", BLOCK_SIZE, SUB, CheckMode::Crc16);
        assert_eq!(packet.len(), 3 + 128 + 2);
        assert_eq!(&packet[..3], &[SOH, 0x01, 0xFE]);
        assert_eq!(&packet[3..8], b"hello");
        assert!(packet[8..131].iter().all(|b| *b == SUB));
        let crc = crc16_xmodem(&packet[3..131]);
        assert_eq!(&packet[131..], &crc.to_be_bytes());

        let packet = build_block(SOH, 2, b"hi", BLOCK_SIZE, SUB, CheckMode::Checksum);
        assert_eq!(packet.len(), 3 + 128 + 1);
        assert_eq!(packet[131], sum8(&packet[3..131]));
    }

    #[test]
    fn test_crc_transfer() {
        let data = vec![0x55u8; 300];
        let (mut channel, written) = scripted(b"C", vec![vec![ACK]; 4]);
        let summary = Xmodem::send(&mut channel, &data, &fast()).unwrap();
        assert_eq!(summary, TransferSummary { blocks: 3, bytes: 300, crc: true });
        let written = written.lock();
        assert_eq!(written.len(), 4);
        assert_eq!(&written[2][..3], &[SOH, 3, 0xFC]);
        assert_eq!(written[3], vec![EOT]);
    }

    #[test]
    fn test_checksum_mode_and_nak_retry() {
        let (mut channel, written) = scripted(&[NAK], vec![vec![NAK], vec![ACK], vec![ACK]]);
        let summary = Xmodem::send(&mut channel, b"abc", &fast()).unwrap();
        assert!(!summary.crc);
        let written = written.lock();
        assert_eq!(written.len(), 3);
        assert_eq!(written[0], written[1]);
        assert_eq!(written[0].len(), 132);
    }

    #[test]
    fn test_cancel_is_fatal() {
        let (mut channel, written) = scripted(b"C", vec![vec![CAN]]);
        let err = Xmodem::send(&mut channel, b"abc", &fast()).unwrap_err();
        assert!(matches!(err, ProtocolError::PeerCancelled));
        assert_eq!(written.lock().len(), 1);
    }

    #[test]
    fn test_start_timeout() {
        let (mut channel, _) = scripted(b"xyz", vec![]);
        let err = Xmodem::send(&mut channel, b"abc", &fast()).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_block_numbers_wrap() {
        let data = vec![0u8; BLOCK_SIZE * 257];
        let (mut channel, written) = scripted(b"C", vec![vec![ACK]; 258]);
        let summary = Xmodem::send(&mut channel, &data, &fast()).unwrap();
        assert_eq!(summary.blocks, 257);
        let written = written.lock();
        assert_eq!(written[0][1], 1);
        assert_eq!(written[254][1], 255);
        assert_eq!(written[255][1], 0);
        assert_eq!(written[256][1], 1);
    }

    #[test]
    fn test_read_block_pads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![7u8; 130]).unwrap();
        assert_eq!(block_count(130, BLOCK_SIZE), 2);
        let second = read_block(&path, 2, BLOCK_SIZE).unwrap();
        assert_eq!(&second[..2], &[7, 7]);
        assert!(second[2..].iter().all(|b| *b == SUB));
    }
}
