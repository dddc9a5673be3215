//! Serial port channel

use super::{config_timeout, Channel, ChannelError, LineBuffer, READ_CHUNK};
use crate::core::runtime::event::Event;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialChannelConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Default read timeout in seconds
    #[serde(default = "super::default_read_timeout")]
    pub timeout: f64,
    /// Data bits (5, 6, 7, 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1, 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: SerialParity,
}

fn default_baudrate() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialChannelConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baudrate: u32) -> Self {
        Self {
            port: port.to_string(),
            baudrate,
            timeout: super::default_read_timeout(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: SerialParity::None,
        }
    }
}

/// Blocking serial port channel
pub struct SerialChannel {
    config: SerialChannelConfig,
    port: Option<Box<dyn SerialPort>>,
    lines: LineBuffer,
}

impl SerialChannel {
    /// Open the port described by `config`
    pub fn open(config: &SerialChannelConfig) -> Result<Self, ChannelError> {
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let timeout = config_timeout(&config.port, config.timeout)?;
        let port = serialport::new(&config.port, config.baudrate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(timeout)
            .open()
            .map_err(|e| ChannelError::Open {
                target: config.port.clone(),
                message: e.to_string(),
            })?;

        tracing::info!(port = %config.port, baud = config.baudrate, "serial channel opened");
        Ok(Self {
            config: config.clone(),
            port: Some(port),
            lines: LineBuffer::default(),
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, ChannelError> {
        self.port.as_mut().ok_or(ChannelError::Closed)
    }
}

impl Channel for SerialChannel {
    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let port = self.port()?;
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(size.min(READ_CHUNK));
        let mut chunk = [0u8; READ_CHUNK];
        while buf.len() < size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            port.set_timeout(remaining).map_err(std::io::Error::from)?;
            let want = (size - buf.len()).min(READ_CHUNK);
            match port.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn read_event(&mut self, timeout: Duration) -> Result<Option<Event>, ChannelError> {
        let mut lines = std::mem::take(&mut self.lines);
        let line = lines.next_line(timeout, |slice| self.read(1, slice));
        self.lines = lines;
        Ok(line?.map(Event::from_channel_bytes))
    }

    fn clear_input(&mut self) -> Result<(), ChannelError> {
        self.lines.clear();
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(|e| ChannelError::Io(e.into()))
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if self.port.take().is_some() {
            tracing::debug!(port = %self.config.port, "serial channel closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial:{}@{}", self.config.port, self.config.baudrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg: SerialChannelConfig =
            serde_json::from_value(serde_json::json!({ "port": "COM3", "parity": "even" })).unwrap();
        assert_eq!(cfg.baudrate, 115_200);
        assert_eq!(cfg.data_bits, 8);
        assert_eq!(cfg.parity, SerialParity::Even);
        assert!((cfg.timeout - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_open_missing_port_fails() {
        let cfg = SerialChannelConfig::new("/dev/protoflow-does-not-exist", 9600);
        assert!(matches!(SerialChannel::open(&cfg), Err(ChannelError::Open { .. })));
    }

    #[test]
    fn test_infinite_timeout_is_an_open_error() {
        let mut cfg = SerialChannelConfig::new("/dev/protoflow-does-not-exist", 9600);
        cfg.timeout = f64::INFINITY;
        match SerialChannel::open(&cfg) {
            Err(ChannelError::Open { message, .. }) => assert!(message.contains("invalid timeout")),
            other => panic!("expected open error, got {:?}", other.map(|c| c.describe())),
        }
    }
}
