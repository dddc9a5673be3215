//! Modbus TCP: MBAP header + PDU

use super::modbus::{ModbusRequest, ModbusResponse};
use super::{param_unit_id, read_exact, ProtocolDriver, ProtocolError, ProtocolKind, RetryPolicy};
use crate::core::channel::Channel;
use crate::core::value::{Args, Value};
use std::time::Duration;

/// MBAP header length
pub const MBAP_LEN: usize = 7;

/// Modbus TCP application protocol header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (always 0)
    pub protocol_id: u16,
    /// Bytes following the length field (unit id + PDU)
    pub length: u16,
    /// Unit identifier
    pub unit_id: u8,
}

impl MbapHeader {
    /// Encode to bytes
    pub fn to_bytes(&self) -> [u8; MBAP_LEN] {
        let mut out = [0u8; MBAP_LEN];
        out[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6] = self.unit_id;
        out
    }

    /// Decode from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < MBAP_LEN {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }
}

/// Build a complete TCP frame
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let header = MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };
    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(pdu);
    frame
}

/// Modbus TCP client; transaction ids increase per driver instance
#[derive(Debug)]
pub struct ModbusTcp {
    policy: RetryPolicy,
    next_tid: u16,
}

impl Default for ModbusTcp {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusTcp {
    /// Create a driver; the first transaction id is 1
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::new(3, Duration::from_secs(2)),
            next_tid: 1,
        }
    }

    fn allocate_tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn exchange(
        channel: &mut dyn Channel,
        tid: u16,
        unit_id: u8,
        request: &ModbusRequest,
        timeout: Duration,
    ) -> Result<ModbusResponse, ProtocolError> {
        channel.write(&encode_frame(tid, unit_id, &request.encode_pdu()))?;
        let raw = read_exact(channel, MBAP_LEN, timeout, "MBAP header")?;
        let header = MbapHeader::from_bytes(&raw)
            .ok_or_else(|| ProtocolError::Framing("truncated MBAP header".into()))?;
        if header.length < 2 {
            return Err(ProtocolError::Framing(format!("MBAP length {} too small", header.length)));
        }
        // consume the PDU even if the header is foreign so the stream stays aligned
        let pdu = read_exact(channel, usize::from(header.length) - 1, timeout, "Modbus TCP PDU")?;
        if header.transaction_id != tid {
            return Err(ProtocolError::Mismatch(format!(
                "transaction id {}, expected {tid}",
                header.transaction_id
            )));
        }
        if header.protocol_id != 0 {
            return Err(ProtocolError::Framing(format!("protocol id {}", header.protocol_id)));
        }
        if header.unit_id != unit_id {
            return Err(ProtocolError::Mismatch(format!(
                "unit id {}, expected {unit_id}",
                header.unit_id
            )));
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
    }
}

impl ProtocolDriver for ModbusTcp {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ModbusTcp
    }

    fn execute(&mut self, channel: &mut dyn Channel, params: &Args) -> Result<Value, ProtocolError> {
        let request = ModbusRequest::from_params(params)?;
        let unit_id = param_unit_id(params)?;
        let policy = self.policy.from_params(params)?;

        let mut tid = 0;
        let response = policy.run("modbus_tcp", |attempt| {
            if attempt > 1 {
                channel.clear_input()?;
            }
            tid = self.allocate_tid();
            tracing::debug!(tid, unit = unit_id, function = request.function.name(), "modbus tcp request");
            Self::exchange(channel, tid, unit_id, &request, policy.timeout)
        })?;

        let mut value = response.to_value();
        if let Value::Map(map) = &mut value {
            map.insert("unit_id".into(), Value::from(unit_id));
            map.insert("transaction_id".into(), Value::from(tid));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::testing::scripted;

    fn params() -> Args {
        let mut params = Args::new();
        params.insert("function".into(), Value::Int(4));
        params.insert("address".into(), Value::Int(0));
        params.insert("quantity".into(), Value::Int(1));
        params.insert("timeout".into(), Value::Int(50));
        params
    }

    fn reply(tid: u16, unit: u8) -> Vec<u8> {
        encode_frame(tid, unit, &[0x04, 0x02, 0x12, 0x34])
    }

    #[test]
    fn test_header_round_trip() {
        let header = MbapHeader {
            transaction_id: 0xBEEF,
            protocol_id: 0,
            length: 6,
            unit_id: 9,
        };
        assert_eq!(MbapHeader::from_bytes(&header.to_bytes()), Some(header));
        assert_eq!(
            encode_frame(1, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]),
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_transaction_ids_increase() {
        let (mut channel, written) = scripted(&[], vec![reply(1, 1), reply(2, 1)]);
        let mut driver = ModbusTcp::new();
        let first = driver.execute(&mut channel, &params()).unwrap();
        let second = driver.execute(&mut channel, &params()).unwrap();
        assert_eq!(first.get("transaction_id"), Some(&Value::Int(1)));
        assert_eq!(second.get("transaction_id"), Some(&Value::Int(2)));
        assert_eq!(second.get("registers"), Some(&Value::List(vec![Value::Int(0x1234)])));
        assert_eq!(&written.lock()[1][..2], &[0x00, 0x02]);
    }

    #[test]
    fn test_stale_transaction_is_retried() {
        let (mut channel, written) = scripted(&[], vec![reply(7, 1), reply(2, 1)]);
        let result = ModbusTcp::new().execute(&mut channel, &params()).unwrap();
        assert_eq!(result.get("transaction_id"), Some(&Value::Int(2)));
        assert_eq!(written.lock().len(), 2);
    }

    #[test]
    fn test_transaction_id_wraps() {
        let mut driver = ModbusTcp::new();
        driver.next_tid = u16::MAX;
        assert_eq!(driver.allocate_tid(), u16::MAX);
        assert_eq!(driver.allocate_tid(), 0);
    }
}
