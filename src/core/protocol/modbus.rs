//! Modbus PDU codec shared by the RTU, ASCII and TCP drivers
//!
//! The PDU (function code + address/quantity/value payload) is identical on
//! every transport; framings only add a unit id and a trailer or header.
//! Registers are big-endian on the wire, coils are packed LSB-first.

use super::{invalid, param, param_int, ProtocolError};
use crate::core::value::{Args, Value};

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Slave ID (0x11)
    ReportSlaveId = 0x11,
}

impl FunctionCode {
    /// Get function code from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x11 => Some(Self::ReportSlaveId),
            _ => None,
        }
    }

    /// Get name of function code
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
            Self::ReportSlaveId => "Report Slave ID",
        }
    }

    /// Reads bits (coils or discrete inputs)
    pub fn reads_bits(self) -> bool {
        matches!(self, Self::ReadCoils | Self::ReadDiscreteInputs)
    }

    /// Reads 16-bit registers
    pub fn reads_registers(self) -> bool {
        matches!(self, Self::ReadHoldingRegisters | Self::ReadInputRegisters)
    }

    /// Carries a quantity field in the request
    pub fn has_quantity(self) -> bool {
        self.reads_bits()
            || self.reads_registers()
            || matches!(self, Self::WriteMultipleCoils | Self::WriteMultipleRegisters)
    }

    fn max_quantity(self) -> u16 {
        match self {
            Self::ReadCoils | Self::ReadDiscreteInputs => 2000,
            Self::ReadHoldingRegisters | Self::ReadInputRegisters => 125,
            Self::WriteMultipleCoils => 1968,
            Self::WriteMultipleRegisters => 123,
            _ => 1,
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal Function (0x01)
    IllegalFunction = 0x01,
    /// Illegal Data Address (0x02)
    IllegalDataAddress = 0x02,
    /// Illegal Data Value (0x03)
    IllegalDataValue = 0x03,
    /// Server Device Failure (0x04)
    ServerDeviceFailure = 0x04,
    /// Acknowledge (0x05)
    Acknowledge = 0x05,
    /// Server Device Busy (0x06)
    ServerDeviceBusy = 0x06,
    /// Memory Parity Error (0x08)
    MemoryParityError = 0x08,
    /// Gateway Path Unavailable (0x0A)
    GatewayPathUnavailable = 0x0A,
    /// Gateway Target Failed to Respond (0x0B)
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Get exception from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Get name of exception
    pub fn name(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::ServerDeviceFailure => "Server Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server Device Busy",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailed => "Gateway Target Failed to Respond",
        }
    }
}

/// A Modbus request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    /// Function code
    pub function: FunctionCode,
    /// Starting address (unused by Report Slave ID)
    pub address: u16,
    /// Number of coils/registers
    pub quantity: u16,
    /// Values to write; coils use 0/1
    pub values: Vec<u16>,
}

impl ModbusRequest {
    /// Create a request, padding or truncating `values` to `quantity` for multi-writes
    pub fn new(
        function: FunctionCode,
        address: u16,
        quantity: u16,
        mut values: Vec<u16>,
    ) -> Result<Self, ProtocolError> {
        let quantity = match function {
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister | FunctionCode::ReportSlaveId => 1,
            _ => quantity,
        };
        if function.has_quantity() && (quantity == 0 || quantity > function.max_quantity()) {
            return Err(invalid(format!(
                "{}: quantity {quantity} outside 1..={}",
                function.name(),
                function.max_quantity()
            )));
        }
        match function {
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                values.resize(1, 0);
            }
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                values.resize(usize::from(quantity), 0);
            }
            _ => values.clear(),
        }
        if function == FunctionCode::WriteSingleCoil || function == FunctionCode::WriteMultipleCoils {
            for v in &mut values {
                *v = u16::from(*v != 0);
            }
        }
        Ok(Self {
            function,
            address,
            quantity,
            values,
        })
    }

    /// Build from action parameters: `function`, `address`, `quantity`, `values`|`value`
    pub fn from_params(params: &Args) -> Result<Self, ProtocolError> {
        let code = param_int(params, &["function"])?.unwrap_or(0x03);
        let function = u8::try_from(code)
            .ok()
            .and_then(FunctionCode::from_u8)
            .ok_or_else(|| invalid(format!("unsupported function code {code:#04x}")))?;
        let address = param_int(params, &["address"])?.unwrap_or(0);
        let address = u16::try_from(address).map_err(|_| invalid(format!("address {address} out of range")))?;

        let values: Vec<u16> = match param(params, &["values", "value"]) {
            None => Vec::new(),
            Some(Value::List(items)) => items
                .iter()
                .map(register_value)
                .collect::<Result<_, _>>()?,
            Some(Value::Bytes(bytes)) => bytes.iter().map(|b| u16::from(*b)).collect(),
            Some(single) => vec![register_value(single)?],
        };

        let quantity = match param_int(params, &["quantity", "count"])? {
            Some(q) => u16::try_from(q).map_err(|_| invalid(format!("quantity {q} out of range")))?,
            None if !values.is_empty() => u16::try_from(values.len()).map_err(|_| invalid("too many values"))?,
            None => 1,
        };
        Self::new(function, address, quantity, values)
    }

    /// Encode as PDU bytes
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = vec![self.function as u8];
        if self.function == FunctionCode::ReportSlaveId {
            return pdu;
        }
        pdu.extend_from_slice(&self.address.to_be_bytes());
        match self.function {
            FunctionCode::WriteSingleCoil => {
                let on = self.values.first().copied().unwrap_or(0) != 0;
                pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            }
            FunctionCode::WriteSingleRegister => {
                pdu.extend_from_slice(&self.values.first().copied().unwrap_or(0).to_be_bytes());
            }
            FunctionCode::WriteMultipleCoils => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                let bits: Vec<bool> = self.values.iter().map(|v| *v != 0).collect();
                let packed = pack_bits(&bits);
                pdu.push(packed.len() as u8);
                pdu.extend_from_slice(&packed);
            }
            FunctionCode::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push((self.values.len() * 2) as u8);
                for reg in &self.values {
                    pdu.extend_from_slice(&reg.to_be_bytes());
                }
            }
            _ => pdu.extend_from_slice(&self.quantity.to_be_bytes()),
        }
        pdu
    }

    /// Decode request PDU bytes (server side)
    pub fn decode_pdu(pdu: &[u8]) -> Result<Self, ProtocolError> {
        let (&code, body) = pdu
            .split_first()
            .ok_or_else(|| ProtocolError::Framing("empty PDU".into()))?;
        let function = FunctionCode::from_u8(code)
            .ok_or_else(|| ProtocolError::Framing(format!("unsupported function code {code:#04x}")))?;
        if function == FunctionCode::ReportSlaveId {
            return Self::new(function, 0, 1, Vec::new());
        }
        if body.len() < 4 {
            return Err(ProtocolError::Framing(format!("{}: PDU too short", function.name())));
        }
        let address = u16::from_be_bytes([body[0], body[1]]);
        let word = u16::from_be_bytes([body[2], body[3]]);
        match function {
            FunctionCode::WriteSingleCoil => Self::new(function, address, 1, vec![u16::from(word == 0xFF00)]),
            FunctionCode::WriteSingleRegister => Self::new(function, address, 1, vec![word]),
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                let byte_count = usize::from(*body.get(4).ok_or_else(|| {
                    ProtocolError::Framing("missing byte count".into())
                })?);
                let data = body
                    .get(5..5 + byte_count)
                    .ok_or_else(|| ProtocolError::Framing("truncated write payload".into()))?;
                let values = if function == FunctionCode::WriteMultipleCoils {
                    unpack_bits(data, usize::from(word)).into_iter().map(u16::from).collect()
                } else {
                    unpack_registers(data)
                };
                Self::new(function, address, word, values)
            }
            _ => Self::new(function, address, word, Vec::new()),
        }
    }
}

fn register_value(v: &Value) -> Result<u16, ProtocolError> {
    match v {
        Value::Bool(b) => Ok(u16::from(*b)),
        other => other
            .as_i64()
            // negative values are written as their two's complement
            .filter(|n| (-0x8000..=0xFFFF).contains(n))
            .map(|n| (n & 0xFFFF) as u16)
            .ok_or_else(|| invalid(format!("register value out of range: {other}"))),
    }
}

/// A decoded Modbus response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    /// Coil or discrete input states
    Bits {
        /// Function code
        function: FunctionCode,
        /// Bit states (padded to whole bytes)
        bits: Vec<bool>,
    },
    /// Register values
    Registers {
        /// Function code
        function: FunctionCode,
        /// Register values
        registers: Vec<u16>,
    },
    /// Echo of a single write
    WriteSingle {
        /// Function code
        function: FunctionCode,
        /// Address written
        address: u16,
        /// Value written (0xFF00 for an ON coil)
        value: u16,
    },
    /// Echo of a multiple write
    WriteMultiple {
        /// Function code
        function: FunctionCode,
        /// Starting address
        address: u16,
        /// Items written
        quantity: u16,
    },
    /// Report Slave ID payload
    SlaveId {
        /// Device-specific data
        data: Vec<u8>,
    },
    /// Exception response
    Exception {
        /// Function code without the exception bit
        function: u8,
        /// Exception code
        code: u8,
    },
}

impl ModbusResponse {
    /// The response a compliant server sends for `request`, reading from the
    /// given register and coil banks
    pub fn for_request(request: &ModbusRequest, registers: &[u16], coils: &[bool]) -> Self {
        let start = usize::from(request.address);
        let end = start + usize::from(request.quantity);
        let function = request.function;
        let out_of_range = |len: usize| end > len;
        match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                if out_of_range(coils.len()) {
                    return Self::exception(function, ExceptionCode::IllegalDataAddress);
                }
                Self::Bits {
                    function,
                    bits: coils[start..end].to_vec(),
                }
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if out_of_range(registers.len()) {
                    return Self::exception(function, ExceptionCode::IllegalDataAddress);
                }
                Self::Registers {
                    function,
                    registers: registers[start..end].to_vec(),
                }
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => Self::WriteSingle {
                function,
                address: request.address,
                value: match (function, request.values.first()) {
                    (FunctionCode::WriteSingleCoil, Some(v)) if *v != 0 => 0xFF00,
                    (FunctionCode::WriteSingleCoil, _) => 0,
                    (_, v) => v.copied().unwrap_or(0),
                },
            },
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => Self::WriteMultiple {
                function,
                address: request.address,
                quantity: request.quantity,
            },
            FunctionCode::ReportSlaveId => Self::SlaveId {
                data: vec![0x01, 0xFF],
            },
        }
    }

    /// Exception response for `function`
    pub fn exception(function: FunctionCode, code: ExceptionCode) -> Self {
        Self::Exception {
            function: function as u8,
            code: code as u8,
        }
    }

    /// Encode as PDU bytes
    pub fn encode_pdu(&self) -> Vec<u8> {
        match self {
            Self::Bits { function, bits } => {
                let packed = pack_bits(bits);
                let mut pdu = vec![*function as u8, packed.len() as u8];
                pdu.extend_from_slice(&packed);
                pdu
            }
            Self::Registers { function, registers } => {
                let mut pdu = vec![*function as u8, (registers.len() * 2) as u8];
                for reg in registers {
                    pdu.extend_from_slice(&reg.to_be_bytes());
                }
                pdu
            }
            Self::WriteSingle { function, address, value } => {
                let mut pdu = vec![*function as u8];
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
                pdu
            }
            Self::WriteMultiple { function, address, quantity } => {
                let mut pdu = vec![*function as u8];
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                pdu
            }
            Self::SlaveId { data } => {
                let mut pdu = vec![FunctionCode::ReportSlaveId as u8, data.len() as u8];
                pdu.extend_from_slice(data);
                pdu
            }
            Self::Exception { function, code } => vec![function | 0x80, *code],
        }
    }

    /// Decode response PDU bytes
    pub fn decode_pdu(pdu: &[u8]) -> Result<Self, ProtocolError> {
        if pdu.len() < 2 {
            return Err(ProtocolError::Framing("response PDU too short".into()));
        }
        let code = pdu[0];
        if code & 0x80 != 0 {
            return Ok(Self::Exception {
                function: code & 0x7F,
                code: pdu[1],
            });
        }
        let function = FunctionCode::from_u8(code)
            .ok_or_else(|| ProtocolError::Framing(format!("unexpected function code {code:#04x}")))?;
        let counted = || -> Result<&[u8], ProtocolError> {
            let count = usize::from(pdu[1]);
            pdu.get(2..2 + count)
                .ok_or_else(|| ProtocolError::Framing(format!("{}: truncated payload", function.name())))
        };
        let words = || -> Result<(u16, u16), ProtocolError> {
            if pdu.len() < 5 {
                return Err(ProtocolError::Framing(format!("{}: response too short", function.name())));
            }
            Ok((
                u16::from_be_bytes([pdu[1], pdu[2]]),
                u16::from_be_bytes([pdu[3], pdu[4]]),
            ))
        };
        Ok(match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                let data = counted()?;
                Self::Bits {
                    function,
                    bits: unpack_bits(data, data.len() * 8),
                }
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => Self::Registers {
                function,
                registers: unpack_registers(counted()?),
            },
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                let (address, value) = words()?;
                Self::WriteSingle { function, address, value }
            }
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                let (address, quantity) = words()?;
                Self::WriteMultiple {
                    function,
                    address,
                    quantity,
                }
            }
            FunctionCode::ReportSlaveId => Self::SlaveId {
                data: counted()?.to_vec(),
            },
        })
    }

    /// Function code echoed by the response (exception bit cleared)
    pub fn function_code(&self) -> u8 {
        match self {
            Self::Bits { function, .. }
            | Self::Registers { function, .. }
            | Self::WriteSingle { function, .. }
            | Self::WriteMultiple { function, .. } => *function as u8,
            Self::SlaveId { .. } => FunctionCode::ReportSlaveId as u8,
            Self::Exception { function, .. } => *function,
        }
    }

    /// Script-facing result map
    pub fn to_value(&self) -> Value {
        let function = ("function", Value::from(self.function_code()));
        match self {
            Self::Bits { bits, .. } => Value::map([
                function,
                ("bits", Value::List(bits.iter().map(|b| Value::Bool(*b)).collect())),
            ]),
            Self::Registers { registers, .. } => Value::map([
                function,
                ("registers", Value::List(registers.iter().map(|r| Value::from(*r)).collect())),
            ]),
            Self::WriteSingle { address, value, .. } => Value::map([
                function,
                ("address", Value::from(*address)),
                ("value", Value::from(*value)),
            ]),
            Self::WriteMultiple { address, quantity, .. } => Value::map([
                function,
                ("address", Value::from(*address)),
                ("quantity", Value::from(*quantity)),
            ]),
            Self::SlaveId { data } => Value::map([function, ("data", Value::bytes(data.clone()))]),
            Self::Exception { code, .. } => Value::map([
                function,
                ("exception", Value::from(*code)),
                (
                    "exception_name",
                    Value::from(ExceptionCode::from_u8(*code).map_or("Unknown Exception", ExceptionCode::name)),
                ),
            ]),
        }
    }
}

/// Pack bits LSB-first into bytes
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &on)| if on { byte | (1 << i) } else { byte })
        })
        .collect()
}

/// Unpack up to `count` LSB-first bits
pub fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count.min(data.len() * 8))
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

/// Parse big-endian registers; a trailing odd byte is ignored
pub fn unpack_registers(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_encoding() {
        let req = ModbusRequest::new(FunctionCode::ReadHoldingRegisters, 0x006B, 3, vec![]).unwrap();
        assert_eq!(req.encode_pdu(), vec![0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_write_single_coil_encoding() {
        let on = ModbusRequest::new(FunctionCode::WriteSingleCoil, 0x00AC, 1, vec![1]).unwrap();
        assert_eq!(on.encode_pdu(), vec![0x05, 0x00, 0xAC, 0xFF, 0x00]);
        let off = ModbusRequest::new(FunctionCode::WriteSingleCoil, 0x00AC, 1, vec![0]).unwrap();
        assert_eq!(off.encode_pdu(), vec![0x05, 0x00, 0xAC, 0x00, 0x00]);
    }

    #[test]
    fn test_write_multiple_coils_encoding() {
        let bits = vec![1, 0, 1, 1, 0, 0, 1, 1, 1, 0];
        let req = ModbusRequest::new(FunctionCode::WriteMultipleCoils, 0x0013, 10, bits).unwrap();
        assert_eq!(
            req.encode_pdu(),
            vec![0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_request_round_trip_all_functions() {
        let cases = [
            (FunctionCode::ReadCoils, 10, 13, vec![]),
            (FunctionCode::ReadDiscreteInputs, 0, 22, vec![]),
            (FunctionCode::ReadHoldingRegisters, 100, 3, vec![]),
            (FunctionCode::ReadInputRegisters, 8, 1, vec![]),
            (FunctionCode::WriteSingleCoil, 172, 1, vec![1]),
            (FunctionCode::WriteSingleRegister, 1, 1, vec![0x0003]),
            (FunctionCode::WriteMultipleCoils, 19, 10, vec![1, 0, 1, 1, 0, 0, 1, 1, 1, 0]),
            (FunctionCode::WriteMultipleRegisters, 1, 2, vec![0x000A, 0x0102]),
        ];
        for (function, address, quantity, values) in cases {
            let req = ModbusRequest::new(function, address, quantity, values).unwrap();
            let decoded = ModbusRequest::decode_pdu(&req.encode_pdu()).unwrap();
            assert_eq!(decoded, req, "{}", function.name());
        }
    }

    #[test]
    fn test_response_round_trip() {
        let responses = [
            ModbusResponse::Registers {
                function: FunctionCode::ReadHoldingRegisters,
                registers: vec![0x022B, 0x0000, 0x0064],
            },
            ModbusResponse::Bits {
                function: FunctionCode::ReadCoils,
                bits: vec![true, false, true, true, false, false, true, true],
            },
            ModbusResponse::WriteSingle {
                function: FunctionCode::WriteSingleRegister,
                address: 1,
                value: 3,
            },
            ModbusResponse::WriteMultiple {
                function: FunctionCode::WriteMultipleRegisters,
                address: 1,
                quantity: 2,
            },
            ModbusResponse::Exception { function: 0x03, code: 0x02 },
        ];
        for response in responses {
            assert_eq!(ModbusResponse::decode_pdu(&response.encode_pdu()).unwrap(), response);
        }
    }

    #[test]
    fn test_exception_value() {
        let value = ModbusResponse::decode_pdu(&[0x83, 0x02]).unwrap().to_value();
        assert_eq!(value.get("function"), Some(&Value::Int(3)));
        assert_eq!(value.get("exception"), Some(&Value::Int(2)));
        assert_eq!(value.get("exception_name"), Some(&Value::from("Illegal Data Address")));
    }

    #[test]
    fn test_from_params_defaults_quantity_to_value_count() {
        let mut params = Args::new();
        params.insert("function".into(), Value::Int(0x10));
        params.insert("address".into(), Value::Int(5));
        params.insert("values".into(), Value::List(vec![Value::Int(1), Value::Int(-1)]));
        let req = ModbusRequest::from_params(&params).unwrap();
        assert_eq!(req.quantity, 2);
        assert_eq!(req.values, vec![1, 0xFFFF]);
    }

    #[test]
    fn test_quantity_limits() {
        assert!(ModbusRequest::new(FunctionCode::ReadHoldingRegisters, 0, 126, vec![]).is_err());
        assert!(ModbusRequest::new(FunctionCode::ReadCoils, 0, 0, vec![]).is_err());
    }

    #[test]
    fn test_server_response_for_request() {
        let regs: Vec<u16> = (0..10).collect();
        let req = ModbusRequest::new(FunctionCode::ReadHoldingRegisters, 8, 2, vec![]).unwrap();
        assert_eq!(
            ModbusResponse::for_request(&req, &regs, &[]),
            ModbusResponse::Registers {
                function: FunctionCode::ReadHoldingRegisters,
                registers: vec![8, 9]
            }
        );
        let req = ModbusRequest::new(FunctionCode::ReadHoldingRegisters, 9, 2, vec![]).unwrap();
        assert!(matches!(
            ModbusResponse::for_request(&req, &regs, &[]),
            ModbusResponse::Exception { code: 0x02, .. }
        ));
    }
}
