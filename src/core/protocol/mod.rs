//! Protocol driver layer
//!
//! Implemented drivers:
//! - Modbus RTU / ASCII / TCP (shared PDU codec in [`modbus`])
//! - XMODEM (128-byte blocks, CRC16 or 8-bit sum)
//! - YMODEM (1024-byte blocks with a header block)
//! - SCPI (line commands, IEEE-488.2 binary blocks)
//! - AT commands (OK/ERROR terminated responses)
//!
//! Every driver performs a complete request/response exchange per
//! [`ProtocolDriver::execute`] call and retries transient failures according
//! to a [`RetryPolicy`].

pub mod at;
pub mod checksum;
pub mod modbus;
pub mod modbus_ascii;
pub mod modbus_rtu;
pub mod modbus_tcp;
pub mod scpi;
pub mod xmodem;
pub mod ymodem;

use crate::core::channel::{Channel, ChannelError};
use crate::core::value::{Args, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No (complete) response within the timeout
    #[error("timeout: {0}")]
    Timeout(String),

    /// CRC, LRC or checksum mismatch
    #[error("checksum error: {0}")]
    Checksum(String),

    /// Malformed or truncated frame
    #[error("framing error: {0}")]
    Framing(String),

    /// Response belongs to another unit or transaction
    #[error("identity mismatch: {0}")]
    Mismatch(String),

    /// Peer aborted the transfer with CAN
    #[error("transfer cancelled by peer")]
    PeerCancelled,

    /// Request parameters are unusable
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Channel failure
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Local file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Transient errors are retried by the driver
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Checksum(_) | Self::Framing(_) | Self::Mismatch(_)
        )
    }

    /// Error class name for recorder records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "ChannelTimeoutError",
            Self::Checksum(_) => "ChecksumError",
            Self::Framing(_) => "FramingError",
            Self::Mismatch(_) => "MismatchError",
            Self::PeerCancelled => "PeerCancelledError",
            Self::InvalidRequest(_) => "InvalidRequestError",
            Self::Channel(_) => "ChannelError",
            Self::Io(_) => "IoError",
        }
    }
}

/// Retry and timeout policy shared by request/response drivers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up (at least one attempt is always made)
    pub retries: u32,
    /// Per-attempt response timeout
    pub timeout: Duration,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_millis(1000),
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(retries: u32, timeout: Duration) -> Self {
        Self {
            retries,
            timeout,
            backoff: Duration::ZERO,
        }
    }

    /// Read `retries` and `timeout` (milliseconds) from params, falling back to `self`
    pub fn from_params(&self, params: &Args) -> Result<Self, ProtocolError> {
        let retries = match param_int(params, &["retries"])? {
            Some(n) => u32::try_from(n).map_err(|_| invalid("retries must be >= 0"))?,
            None => self.retries,
        };
        let timeout = param_duration_ms(params, &["timeout"])?.unwrap_or(self.timeout);
        Ok(Self {
            retries,
            timeout,
            backoff: self.backoff,
        })
    }

    /// Run `attempt` until it succeeds, fails permanently, or attempts run out.
    /// The last transient error is returned after the final attempt.
    pub fn run<T>(
        &self,
        label: &str,
        mut attempt: impl FnMut(u32) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let attempts = self.retries.max(1);
        let mut n = 1;
        loop {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && n < attempts => {
                    tracing::warn!(protocol = label, attempt = n, of = attempts, error = %e, "retrying");
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                    n += 1;
                }
                Err(e) => {
                    tracing::error!(protocol = label, attempts = n, error = %e, "request failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Closed set of protocol drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolKind {
    /// Modbus RTU
    ModbusRtu,
    /// Modbus ASCII
    ModbusAscii,
    /// Modbus TCP
    ModbusTcp,
    /// XMODEM sender
    Xmodem,
    /// YMODEM sender
    Ymodem,
    /// SCPI command/query
    Scpi,
    /// AT command
    At,
}

impl ProtocolKind {
    /// All drivers
    pub fn all() -> &'static [ProtocolKind] {
        &[
            Self::ModbusRtu,
            Self::ModbusAscii,
            Self::ModbusTcp,
            Self::Xmodem,
            Self::Ymodem,
            Self::Scpi,
            Self::At,
        ]
    }

    /// Registry key
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModbusRtu => "modbus_rtu",
            Self::ModbusAscii => "modbus_ascii",
            Self::ModbusTcp => "modbus_tcp",
            Self::Xmodem => "xmodem",
            Self::Ymodem => "ymodem",
            Self::Scpi => "scpi",
            Self::At => "at",
        }
    }

    /// Build a fresh driver
    pub fn create(self) -> Box<dyn ProtocolDriver> {
        match self {
            Self::ModbusRtu => Box::new(modbus_rtu::ModbusRtu::new()),
            Self::ModbusAscii => Box::new(modbus_ascii::ModbusAscii::new()),
            Self::ModbusTcp => Box::new(modbus_tcp::ModbusTcp::new()),
            Self::Xmodem => Box::new(xmodem::Xmodem::new()),
            Self::Ymodem => Box::new(ymodem::Ymodem::new()),
            Self::Scpi => Box::new(scpi::Scpi::new()),
            Self::At => Box::new(at::AtCommand::new()),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| invalid(format!("unknown protocol: {s}")))
    }
}

/// A protocol driver performing one full exchange per call
pub trait ProtocolDriver: Send {
    /// Which protocol this is
    fn kind(&self) -> ProtocolKind;

    /// Frame the request, exchange it over `channel` with retries, parse the response
    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError>;
}

/// Driver constructor stored in the registry
pub type DriverFactory = fn() -> Box<dyn ProtocolDriver>;

/// Maps protocol names to driver constructors
#[derive(Clone)]
pub struct ProtocolRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProtocolRegistry {
    /// Registry without drivers
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in driver
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("modbus_rtu", || ProtocolKind::ModbusRtu.create());
        registry.register("modbus_ascii", || ProtocolKind::ModbusAscii.create());
        registry.register("modbus_tcp", || ProtocolKind::ModbusTcp.create());
        registry.register("xmodem", || ProtocolKind::Xmodem.create());
        registry.register("ymodem", || ProtocolKind::Ymodem.create());
        registry.register("scpi", || ProtocolKind::Scpi.create());
        registry.register("at", || ProtocolKind::At.create());
        registry
    }

    /// Register or replace a constructor
    pub fn register(&mut self, name: &str, factory: DriverFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Construct a driver by name
    pub fn create(&self, name: &str) -> Result<Box<dyn ProtocolDriver>, ProtocolError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| invalid(format!("protocol not registered: {name}")))
    }

    /// Registered names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

pub(crate) fn invalid(message: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidRequest(message.into())
}

/// First present, non-null parameter among `keys`
pub fn param<'a>(params: &'a Args, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| params.get(*k).filter(|v| !v.is_null()))
}

/// Integer parameter
pub fn param_int(params: &Args, keys: &[&str]) -> Result<Option<i64>, ProtocolError> {
    param(params, keys)
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| invalid(format!("{} must be an integer, got {v}", keys[0])))
        })
        .transpose()
}

/// String parameter
pub fn param_str(params: &Args, keys: &[&str]) -> Option<String> {
    param(params, keys).map(ToString::to_string)
}

/// Boolean parameter
pub fn param_bool(params: &Args, keys: &[&str]) -> Result<Option<bool>, ProtocolError> {
    param(params, keys)
        .map(|v| {
            v.as_bool()
                .ok_or_else(|| invalid(format!("{} must be a boolean, got {v}", keys[0])))
        })
        .transpose()
}

/// Duration parameter given in milliseconds
pub fn param_duration_ms(params: &Args, keys: &[&str]) -> Result<Option<Duration>, ProtocolError> {
    param(params, keys)
        .map(|v| {
            v.as_f64()
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .map(|ms| Duration::from_secs_f64(ms / 1000.0))
                .ok_or_else(|| invalid(format!("{} must be a duration in ms, got {v}", keys[0])))
        })
        .transpose()
}

/// Terminator parameter; accepts escaped text such as `"\r\n"`
pub fn param_terminator(params: &Args, default: &[u8]) -> Vec<u8> {
    match param(params, &["terminator"]) {
        Some(Value::Bytes(b)) => b.clone(),
        Some(v) => unescape_terminator(&v.to_string()),
        None => default.to_vec(),
    }
}

fn unescape_terminator(text: &str) -> Vec<u8> {
    text.replace("\\r", "\r").replace("\\n", "\n").replace("\\t", "\t").into_bytes()
}

/// Read exactly `size` bytes or fail with a timeout
pub(crate) fn read_exact(
    channel: &mut dyn Channel,
    size: usize,
    timeout: Duration,
    what: &str,
) -> Result<Vec<u8>, ProtocolError> {
    let data = channel.read(size, timeout)?;
    if data.len() < size {
        return Err(ProtocolError::Timeout(format!(
            "{what}: got {} of {size} bytes",
            data.len()
        )));
    }
    Ok(data)
}

/// Unit id parameter (`unit_id`, `unit`, `slave`), default 1
pub(crate) fn param_unit_id(params: &Args) -> Result<u8, ProtocolError> {
    match param_int(params, &["unit_id", "unit", "slave"])? {
        Some(id) => u8::try_from(id).map_err(|_| invalid(format!("unit id {id} out of range"))),
        None => Ok(1),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_retries_transient_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let mut calls = 0;
        let result: Result<u8, _> = policy.run("test", |_| {
            calls += 1;
            Err(ProtocolError::Checksum("bad".into()))
        });
        assert!(matches!(result, Err(ProtocolError::Checksum(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_policy_stops_on_fatal_error() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let mut calls = 0;
        let result: Result<u8, _> = policy.run("test", |_| {
            calls += 1;
            Err(ProtocolError::PeerCancelled)
        });
        assert!(matches!(result, Err(ProtocolError::PeerCancelled)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_policy_succeeds_after_timeout() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let result = policy.run("test", |n| {
            if n < 2 {
                Err(ProtocolError::Timeout("no reply".into()))
            } else {
                Ok(n)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_policy_from_params() {
        let mut params = Args::new();
        params.insert("retries".into(), Value::Int(5));
        params.insert("timeout".into(), Value::Int(250));
        let policy = RetryPolicy::default().from_params(&params).unwrap();
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_registry() {
        let registry = ProtocolRegistry::with_builtins();
        assert_eq!(registry.names().count(), ProtocolKind::all().len());
        assert_eq!(registry.create("xmodem").unwrap().kind(), ProtocolKind::Xmodem);
        assert!(registry.create("zmodem").is_err());
        assert_eq!("MODBUS_TCP".parse::<ProtocolKind>().unwrap(), ProtocolKind::ModbusTcp);
    }

    #[test]
    fn test_terminator_unescape() {
        let mut params = Args::new();
        params.insert("terminator".into(), Value::from("\\r\\n"));
        assert_eq!(param_terminator(&params, b"\n"), b"\r\n");
        assert_eq!(param_terminator(&Args::new(), b"\n"), b"\n");
    }
}
