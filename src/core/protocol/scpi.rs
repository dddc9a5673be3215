//! SCPI command/query driver
//!
//! Queries (commands containing `?`) read one response: either a text line
//! or an IEEE-488.2 definite-length block `#<n><len><data>`.

use super::{
    invalid, param_bool, param_duration_ms, param_int, param_str, param_terminator, read_exact, ProtocolDriver,
    ProtocolError, ProtocolKind, RetryPolicy,
};
use crate::core::channel::Channel;
use crate::core::value::{Args, Value};
use std::time::{Duration, Instant};

/// Largest definite-length block accepted unless `max_block` says otherwise
pub const DEFAULT_MAX_BLOCK: usize = 1 << 20;

/// Parsed SCPI response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpiResponse {
    /// Command sent without reading a reply
    NoReply,
    /// Text line
    Text {
        /// Bytes as received, terminator included
        raw: Vec<u8>,
        /// Decoded text, optionally without trailing CR/LF
        text: String,
    },
    /// Definite-length binary block
    Block {
        /// Bytes as received, header and terminator included
        raw: Vec<u8>,
        /// Block payload
        data: Vec<u8>,
    },
}

impl ScpiResponse {
    /// Script-facing result map
    pub fn to_value(&self) -> Value {
        match self {
            Self::NoReply => Value::map([
                ("ok", Value::Bool(true)),
                ("raw", Value::bytes(Vec::new())),
                ("text", Value::Null),
            ]),
            Self::Text { raw, text } => Value::map([
                ("ok", Value::Bool(true)),
                ("raw", Value::bytes(raw.clone())),
                ("text", Value::from(text.as_str())),
            ]),
            Self::Block { raw, data } => Value::map([
                ("ok", Value::Bool(true)),
                ("raw", Value::bytes(raw.clone())),
                ("block", Value::bytes(data.clone())),
                ("length", Value::from(data.len())),
            ]),
        }
    }
}

/// Append `terminator` unless the command already ends with it
pub fn build_command(cmd: &str, terminator: &[u8]) -> Vec<u8> {
    let mut out = cmd.as_bytes().to_vec();
    if !out.ends_with(terminator) {
        out.extend_from_slice(terminator);
    }
    out
}

/// Read one response within `timeout`; blocks longer than `max_block` are rejected
pub fn read_response(
    channel: &mut dyn Channel,
    terminator: &[u8],
    timeout: Duration,
    strip: bool,
    max_block: usize,
) -> Result<ScpiResponse, ProtocolError> {
    let deadline = Instant::now() + timeout;
    let remaining = || deadline.saturating_duration_since(Instant::now());

    let first = read_exact(channel, 1, remaining(), "SCPI response")?;
    if first[0] == b'#' {
        let digit = read_exact(channel, 1, remaining(), "SCPI block header")?;
        if let Some(ndigits) = char::from(digit[0]).to_digit(10) {
            let len_field = read_exact(channel, ndigits as usize, remaining(), "SCPI block length")?;
            let len: usize = std::str::from_utf8(&len_field)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Framing(format!("bad block length {len_field:?}")))?;
            if len > max_block {
                return Err(ProtocolError::Framing(format!(
                    "block of {len} bytes exceeds limit of {max_block}"
                )));
            }
            let data = read_exact(channel, len, remaining(), "SCPI block data")?;
            let tail = channel.read_until(terminator, remaining())?;

            let mut raw = first;
            raw.extend_from_slice(&digit);
            raw.extend_from_slice(&len_field);
            raw.extend_from_slice(&data);
            raw.extend_from_slice(&tail);
            return Ok(ScpiResponse::Block { raw, data });
        }
        let mut raw = first;
        raw.extend_from_slice(&digit);
        return finish_text(channel, raw, terminator, remaining(), strip);
    }
    finish_text(channel, first, terminator, remaining(), strip)
}

fn finish_text(
    channel: &mut dyn Channel,
    mut raw: Vec<u8>,
    terminator: &[u8],
    timeout: Duration,
    strip: bool,
) -> Result<ScpiResponse, ProtocolError> {
    if !raw.ends_with(terminator) {
        raw.extend(channel.read_until(terminator, timeout)?);
    }
    if !raw.ends_with(terminator) {
        return Err(ProtocolError::Timeout(format!(
            "SCPI response unterminated after {} bytes",
            raw.len()
        )));
    }
    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if strip {
        text.truncate(text.trim_end_matches(['\r', '\n']).len());
    }
    Ok(ScpiResponse::Text { raw, text })
}

/// SCPI driver
#[derive(Debug)]
pub struct Scpi {
    policy: RetryPolicy,
}

impl Default for Scpi {
    fn default() -> Self {
        Self::new()
    }
}

impl Scpi {
    /// One attempt, 2 s timeout
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::new(1, Duration::from_secs(2)),
        }
    }
}

impl ProtocolDriver for Scpi {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Scpi
    }

    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError> {
        let cmd = param_str(params, &["cmd", "command"]).ok_or_else(|| invalid("cmd is required"))?;
        let terminator = param_terminator(params, b"\n");
        let expect = param_bool(params, &["expect_response"])?.unwrap_or_else(|| cmd.contains('?'));
        let strip = param_bool(params, &["strip"])?.unwrap_or(true);
        let timeout = param_duration_ms(params, &["timeout"])?.unwrap_or(self.policy.timeout);
        let retries = match param_int(params, &["retries"])? {
            Some(n) => u32::try_from(n).map_err(|_| invalid("retries must be >= 0"))?,
            None => self.policy.retries,
        };
        let max_block = match param_int(params, &["max_block"])? {
            Some(n) => usize::try_from(n).map_err(|_| invalid("max_block must be >= 0"))?,
            None => DEFAULT_MAX_BLOCK,
        };
        let policy = RetryPolicy::new(retries, timeout);
        let payload = build_command(&cmd, &terminator);

        let response = policy.run("scpi", |attempt| {
            if attempt > 1 {
                channel.clear_input()?;
            }
            tracing::debug!(cmd = %cmd, "scpi command");
            channel.write(&payload)?;
            if !expect {
                return Ok(ScpiResponse::NoReply);
            }
            read_response(channel, &terminator, timeout, strip, max_block)
        })?;
        Ok(response.to_value())
    }
}
