//! Modbus RTU: `unit | PDU | CRC16 (little-endian)`

use super::checksum::{append_crc16_modbus, verify_crc16_modbus};
use super::modbus::{ModbusRequest, ModbusResponse};
use super::{param_unit_id, read_exact, ProtocolDriver, ProtocolError, ProtocolKind, RetryPolicy};
use crate::core::channel::Channel;
use crate::core::value::{Args, Value};
use std::time::Duration;

/// Build a complete RTU frame
pub fn encode_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    append_crc16_modbus(&mut frame);
    frame
}

/// Validate the CRC trailer and split a frame into unit id and PDU
pub fn decode_frame(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::Framing(format!("RTU frame too short ({} bytes)", frame.len())));
    }
    if !verify_crc16_modbus(frame) {
        return Err(ProtocolError::Checksum(format!("RTU CRC mismatch in {}", hex::encode_upper(frame))));
    }
    Ok((frame[0], &frame[1..frame.len() - 2]))
}

/// Total response length inferred from the first three bytes
/// (unit, function, byte count or address high byte)
pub fn expected_response_len(header: &[u8; 3]) -> Result<usize, ProtocolError> {
    let function = header[1];
    if function & 0x80 != 0 {
        return Ok(5);
    }
    match function {
        0x01..=0x04 | 0x11 => Ok(3 + usize::from(header[2]) + 2),
        0x05 | 0x06 | 0x0F | 0x10 => Ok(8),
        other => Err(ProtocolError::Framing(format!("cannot frame function {other:#04x}"))),
    }
}

/// Modbus RTU master
#[derive(Debug, Default)]
pub struct ModbusRtu {
    policy: RetryPolicy,
}

impl ModbusRtu {
    /// Create a driver with the default retry policy
    pub fn new() -> Self {
        Self::default()
    }

    fn exchange(
        channel: &mut dyn Channel,
        unit_id: u8,
        request: &ModbusRequest,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<ModbusResponse, ProtocolError> {
        channel.write(frame)?;
        let head = read_exact(channel, 3, timeout, "RTU response header")?;
        let header = [head[0], head[1], head[2]];
        let total = expected_response_len(&header)?;
        let rest = read_exact(channel, total - 3, timeout, "RTU response body")?;

        let mut response = head;
        response.extend_from_slice(&rest);
        tracing::trace!(rx = %hex::encode_upper(&response), "modbus rtu response");

        let (unit, pdu) = decode_frame(&response)?;
        if unit != unit_id {
            return Err(ProtocolError::Mismatch(format!("unit id {unit}, expected {unit_id}")));
        }
        let response = ModbusResponse::decode_pdu(pdu)?;
        if response.function_code() != request.function as u8 {
            return Err(ProtocolError::Mismatch(format!(
                "function {:#04x}, expected {:#04x}",
                response.function_code(),
                request.function as u8
            )));
        }
        Ok(response)
    }
}

impl ProtocolDriver for ModbusRtu {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ModbusRtu
    }

    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError> {
        let request = ModbusRequest::from_params(params)?;
        let unit_id = param_unit_id(params)?;
        let policy = self.policy.from_params(params)?;
        let frame = encode_frame(unit_id, &request.encode_pdu());
        tracing::debug!(
            unit = unit_id,
            function = request.function.name(),
            tx = %hex::encode_upper(&frame),
            "modbus rtu request"
        );

        let response = policy.run("modbus_rtu", |attempt| {
            if attempt > 1 {
                channel.clear_input()?;
            }
            Self::exchange(channel, unit_id, &request, &frame, policy.timeout)
        })?;

        let mut value = response.to_value();
        if let Value::Map(map) = &mut value {
            map.insert("unit_id".into(), Value::from(unit_id));
        }
        Ok(value)
    }
}
