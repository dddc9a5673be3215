//! Modbus ASCII: `:` + hex(unit | PDU | LRC) + CR LF

use super::checksum::lrc;
use super::modbus::{ModbusRequest, ModbusResponse};
use super::{param_unit_id, ProtocolDriver, ProtocolError, ProtocolKind, RetryPolicy};
use crate::core::channel::Channel;
use crate::core::value::{Args, Value};

/// Build a complete ASCII frame
pub fn encode_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(pdu.len() + 1);
    payload.push(unit_id);
    payload.extend_from_slice(pdu);
    let check = lrc(&payload);
    payload.push(check);

    let mut frame = Vec::with_capacity(payload.len() * 2 + 3);
    frame.push(b':');
    frame.extend_from_slice(hex::encode_upper(&payload).as_bytes());
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Decode a received line into unit id and PDU, checking the LRC
pub fn decode_frame(line: &[u8]) -> Result<(u8, Vec<u8>), ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::Framing("non-ASCII bytes in frame".into()))?
        .trim();
    let body = text
        .strip_prefix(':')
        .ok_or_else(|| ProtocolError::Framing(format!("missing ':' in {text:?}")))?;
    if body.len() < 4 || body.len() % 2 != 0 {
        return Err(ProtocolError::Framing(format!("bad ASCII frame length {}", body.len())));
    }
    let bytes = hex::decode(body).map_err(|e| ProtocolError::Framing(format!("bad hex: {e}")))?;
    let (payload, check) = bytes.split_at(bytes.len() - 1);
    let expected = lrc(payload);
    if check[0] != expected {
        return Err(ProtocolError::Checksum(format!(
            "LRC {:02X}, expected {expected:02X}",
            check[0]
        )));
    }
    Ok((payload[0], payload[1..].to_vec()))
}

/// Modbus ASCII master
#[derive(Debug, Default)]
pub struct ModbusAscii {
    policy: RetryPolicy,
}

impl ModbusAscii {
    /// Create a driver with the default retry policy
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProtocolDriver for ModbusAscii {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ModbusAscii
    }

    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError> {
        let request = ModbusRequest::from_params(params)?;
        let unit_id = param_unit_id(params)?;
        let policy = self.policy.from_params(params)?;
        let frame = encode_frame(unit_id, &request.encode_pdu());
        tracing::debug!(unit = unit_id, function = request.function.name(), "modbus ascii request");

        let response = policy.run("modbus_ascii", |attempt| {
            if attempt > 1 {
                channel.clear_input()?;
            }
            channel.write(&frame)?;
            let line = channel.read_until(b"\r\n", policy.timeout)?;
            if !line.ends_with(b"\r\n") {
                return Err(ProtocolError::Timeout(format!(
                    "ASCII response incomplete after {:?} ({} bytes)",
                    policy.timeout,
                    line.len()
                )));
            }
            let (unit, pdu) = decode_frame(&line)?;
            if unit != unit_id {
                return Err(ProtocolError::Mismatch(format!("unit id {unit}, expected {unit_id}")));
            }
            let response = ModbusResponse::decode_pdu(&pdu)?;
            if response.function_code() != request.function as u8 {
                return Err(ProtocolError::Mismatch(format!(
                    "function {:#04x}, expected {:#04x}",
                    response.function_code(),
                    request.function as u8
                )));
            }
            Ok(response)
        })?;

        let mut value = response.to_value();
        if let Value::Map(map) = &mut value {
            map.insert("unit_id".into(), Value::from(unit_id));
        }
        Ok(value)
    }
}
