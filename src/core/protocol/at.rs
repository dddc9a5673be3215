//! AT command driver

use super::{
    invalid, param_bool, param_duration_ms, param_int, param_str, param_terminator, ProtocolDriver, ProtocolError,
    ProtocolKind, RetryPolicy,
};
use crate::core::channel::Channel;
use crate::core::value::{Args, Value};
use std::time::{Duration, Instant};

/// Final status of an AT exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    /// Intermediate lines between the echo and the final status
    pub lines: Vec<String>,
    /// The ERROR line, when the command failed
    pub error: Option<String>,
}

impl AtResponse {
    /// Script-facing result map
    pub fn to_value(&self) -> Value {
        let lines = Value::List(self.lines.iter().map(|l| Value::from(l.as_str())).collect());
        match &self.error {
            None => Value::map([("ok", Value::Bool(true)), ("lines", lines)]),
            Some(error) => Value::map([
                ("ok", Value::Bool(false)),
                ("lines", lines),
                ("error", Value::from(error.as_str())),
            ]),
        }
    }
}

/// Normalize a command: trimmed, `AT`-prefixed
pub fn normalize_command(cmd: &str) -> String {
    let cmd = cmd.trim();
    if cmd.to_ascii_uppercase().starts_with("AT") {
        cmd.to_string()
    } else {
        format!("AT{cmd}")
    }
}

/// Status line matching
#[derive(Debug, Clone)]
pub struct AtMatcher {
    /// Success line (exact, case-insensitive)
    pub ok: String,
    /// Failure prefix (case-insensitive)
    pub error: String,
    /// Skip a line repeating the command
    pub echo: bool,
}

impl Default for AtMatcher {
    fn default() -> Self {
        Self {
            ok: "OK".into(),
            error: "ERROR".into(),
            echo: true,
        }
    }
}

/// Read lines until the status line or the timeout
pub fn read_response(
    channel: &mut dyn Channel,
    command: &str,
    matcher: &AtMatcher,
    terminator: &[u8],
    timeout: Duration,
) -> Result<AtResponse, ProtocolError> {
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProtocolError::Timeout(format!(
                "no {}/{} for {command} within {timeout:?}",
                matcher.ok, matcher.error
            )));
        }
        let line = channel.read_until(terminator, remaining)?;
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if text.is_empty() {
            continue;
        }
        if matcher.echo && text.eq_ignore_ascii_case(command) {
            continue;
        }
        if text.eq_ignore_ascii_case(&matcher.ok) {
            return Ok(AtResponse { lines, error: None });
        }
        if text.to_ascii_uppercase().starts_with(&matcher.error.to_ascii_uppercase()) {
            return Ok(AtResponse {
                lines,
                error: Some(text),
            });
        }
        lines.push(text);
    }
}

/// AT command driver
#[derive(Debug)]
pub struct AtCommand {
    policy: RetryPolicy,
}

impl Default for AtCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl AtCommand {
    /// One attempt, 2 s timeout
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::new(1, Duration::from_secs(2)),
        }
    }
}

impl ProtocolDriver for AtCommand {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::At
    }

    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError> {
        let raw_cmd = param_str(params, &["cmd", "command"]).ok_or_else(|| invalid("cmd is required"))?;
        let command = normalize_command(&raw_cmd);
        let terminator = param_terminator(params, b"\r\n");
        let defaults = AtMatcher::default();
        let matcher = AtMatcher {
            ok: param_str(params, &["ok"]).unwrap_or(defaults.ok),
            error: param_str(params, &["error"]).unwrap_or(defaults.error),
            echo: param_bool(params, &["echo"])?.unwrap_or(defaults.echo),
        };
        let timeout = param_duration_ms(params, &["timeout"])?.unwrap_or(self.policy.timeout);
        let retries = match param_int(params, &["retries"])? {
            Some(n) => u32::try_from(n).map_err(|_| invalid("retries must be >= 0"))?,
            None => self.policy.retries,
        };

        let mut payload = command.clone().into_bytes();
        if !payload.ends_with(&terminator) {
            payload.extend_from_slice(&terminator);
        }

        let response = RetryPolicy::new(retries, timeout).run("at", |attempt| {
            if attempt > 1 {
                channel.clear_input()?;
            }
            tracing::debug!(cmd = %command, "at command");
            channel.write(&payload)?;
            read_response(channel, &command, &matcher, &terminator, timeout)
        })?;
        if let Some(error) = &response.error {
            tracing::warn!(cmd = %command, error = %error, "at command rejected");
        }
        Ok(response.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::testing::scripted;

    fn params(cmd: &str) -> Args {
        let mut params = Args::new();
        params.insert("cmd".into(), Value::from(cmd));
        params.insert("timeout".into(), Value::Int(50));
        params
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_command(" +CSQ "), "AT+CSQ");
        assert_eq!(normalize_command("at+gmr"), "at+gmr");
    }

    #[test]
    fn test_ok_with_echo_and_lines() {
        let reply = b"AT+CSQ\r\n\r\n+CSQ: 21,0\r\n\r\nOK\r\n".to_vec();
        let (mut channel, written) = scripted(&[], vec![reply]);
        let result = AtCommand::new().execute(&mut channel, &params("+CSQ")).unwrap();
        assert_eq!(result.get("ok"), Some(&Value::Bool(true)));
        assert_eq!(result.get("lines"), Some(&Value::List(vec![Value::from("+CSQ: 21,0")])));
        assert_eq!(written.lock()[0], b"AT+CSQ\r\n");
    }

    #[test]
    fn test_error_line() {
        let (mut channel, _) = scripted(&[], vec![b"+CME ERROR: 10\r\nERROR\r\n".to_vec()]);
        let result = AtCommand::new().execute(&mut channel, &params("AT+CPIN?")).unwrap();
        assert_eq!(result.get("ok"), Some(&Value::Bool(false)));
        assert_eq!(result.get("error"), Some(&Value::from("ERROR")));
        assert_eq!(result.get("lines"), Some(&Value::List(vec![Value::from("+CME ERROR: 10")])));
    }

    #[test]
    fn test_timeout_without_status() {
        let (mut channel, _) = scripted(&[], vec![b"+CSQ: 1\r\n".to_vec()]);
        let err = AtCommand::new().execute(&mut channel, &params("AT+CSQ")).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }
}
