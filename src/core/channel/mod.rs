//! Byte channels
//!
//! Supports:
//! - Serial ports (blocking `serialport`)
//! - Raw TCP connections
//! - Scripted simulators for tests and dry runs
//!
//! Protocol drivers only see the [`Channel`] trait. Reads are bounded by an
//! explicit timeout and return whatever arrived, possibly fewer bytes than
//! requested; drivers decide whether a short read is a timeout.

mod serial;
mod simulator;
mod tcp;

pub use serial::{SerialChannel, SerialChannelConfig};
pub use simulator::{
    MatchCondition, ModbusFraming, ResponseAction, SimulatedChannel, SimulatorConfig, SimulatorHandle,
    SimulatorRule,
};
pub use tcp::{TcpChannel, TcpChannelConfig};

use crate::core::runtime::event::Event;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Channel error types
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Opening the channel failed
    #[error("failed to open {target}: {message}")]
    Open {
        /// Port or address
        target: String,
        /// Underlying reason
        message: String,
    },

    /// Nothing arrived within the timeout
    #[error("channel timeout after {0:?}")]
    Timeout(Duration),

    /// Channel already closed
    #[error("channel closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel configuration as written in a script's `channels` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// Serial port
    Serial(SerialChannelConfig),
    /// TCP client
    Tcp(TcpChannelConfig),
    /// Scripted simulator
    Simulator(SimulatorConfig),
}

impl ChannelConfig {
    /// Type name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serial(_) => "serial",
            Self::Tcp(_) => "tcp",
            Self::Simulator(_) => "simulator",
        }
    }

    /// Open the channel
    pub fn open(&self) -> Result<Box<dyn Channel>, ChannelError> {
        Ok(match self {
            Self::Serial(cfg) => Box::new(SerialChannel::open(cfg)?),
            Self::Tcp(cfg) => Box::new(TcpChannel::connect(cfg)?),
            Self::Simulator(cfg) => Box::new(SimulatedChannel::new(cfg.clone())?),
        })
    }
}

/// Blocking byte channel with bounded reads
#[cfg_attr(test, mockall::automock)]
pub trait Channel: Send {
    /// Write all bytes
    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Read up to `size` bytes, returning early only when `size` bytes arrived
    fn read(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError>;

    /// Read until `terminator` or the timeout; the terminator is included when seen
    fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = self.read(1, remaining.min(Duration::from_millis(50)))?;
            buf.extend_from_slice(&chunk);
            if !terminator.is_empty() && buf.ends_with(terminator) {
                break;
            }
        }
        Ok(buf)
    }

    /// Wait for an unsolicited event such as a complete line pushed by the device
    fn read_event(&mut self, timeout: Duration) -> Result<Option<Event>, ChannelError>;

    /// Discard pending input
    fn clear_input(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Close the channel; further I/O fails with [`ChannelError::Closed`]
    fn close(&mut self) -> Result<(), ChannelError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

fn default_read_timeout() -> f64 {
    1.0
}

/// Largest single read issued to an OS handle
const READ_CHUNK: usize = 4096;

/// Convert a configured timeout in seconds, rejecting negative and non-finite values
fn config_timeout(target: &str, secs: f64) -> Result<Duration, ChannelError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ChannelError::Open {
        target: target.to_string(),
        message: format!("invalid timeout {secs}: {e}"),
    })
}

/// Bytes of an unfinished line, kept between event polls
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Pull bytes through `read` until a `\n` completes a line or `timeout` passes
    fn next_line(
        &mut self,
        timeout: Duration,
        mut read: impl FnMut(Duration) -> Result<Vec<u8>, ChannelError>,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let rest = self.pending.split_off(pos + 1);
                return Ok(Some(std::mem::replace(&mut self.pending, rest)));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let chunk = read(remaining.min(Duration::from_millis(50)))?;
            self.pending.extend_from_slice(&chunk);
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}
