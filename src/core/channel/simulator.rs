//! Scripted device simulator
//!
//! Answers writes according to ordered match/respond rules and can act as a
//! Modbus server over a register and coil bank. Useful for dry runs and for
//! exercising scripts without hardware.

use super::{Channel, ChannelError};
use crate::core::protocol::modbus::{ExceptionCode, FunctionCode, ModbusRequest, ModbusResponse};
use crate::core::protocol::modbus_tcp::{MbapHeader, MBAP_LEN};
use crate::core::protocol::{modbus_ascii, modbus_rtu};
use crate::core::runtime::event::{Event, EventSource};
use crate::core::value::Value;
use bytes::BytesMut;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(5);

/// Rule condition evaluated against each written frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchCondition {
    /// Exact bytes given as hex
    Exact {
        /// Hex string, whitespace ignored
        hex: String,
    },
    /// Hex prefix pattern; `*` or `??` match any byte
    HexPattern {
        /// Space-separated hex bytes
        pattern: String,
    },
    /// Substring match
    Text {
        /// Text to find
        text: String,
        /// Case-sensitive comparison
        #[serde(default = "default_true")]
        case_sensitive: bool,
    },
    /// Regular expression over the lossily decoded frame
    Regex {
        /// Pattern
        pattern: String,
    },
    /// Frame length within bounds
    LengthRange {
        /// Minimum length
        min: usize,
        /// Maximum length
        max: usize,
    },
    /// Every frame
    Any,
}

fn default_true() -> bool {
    true
}

/// Modbus framing answered by [`ResponseAction::Modbus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModbusFraming {
    /// CRC-terminated binary frames
    #[default]
    Rtu,
    /// Colon/LRC text frames
    Ascii,
    /// MBAP-prefixed frames
    Tcp,
}

/// What the simulator sends back when a rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseAction {
    /// Fixed bytes given as hex
    SendHex {
        /// Hex string, whitespace ignored
        hex: String,
    },
    /// Fixed text
    SendText {
        /// Text sent as UTF-8
        text: String,
    },
    /// Echo the written frame
    Echo,
    /// Stay silent
    None,
    /// Answer as a Modbus server backed by the register/coil banks
    Modbus {
        /// Wire framing
        #[serde(default)]
        framing: ModbusFraming,
        /// Answer only this unit id (any when absent)
        #[serde(default)]
        unit_id: Option<u8>,
    },
}

/// One match/respond rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorRule {
    /// Condition
    #[serde(rename = "match")]
    pub condition: MatchCondition,
    /// Response
    pub respond: ResponseAction,
    /// Stop matching after this many hits
    #[serde(default)]
    pub max_hits: Option<usize>,
}

/// Simulator configuration (`type: simulator` channels)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Bytes pending for the first read, as hex
    pub preload: Option<String>,
    /// Event names delivered by `read_event`, in order
    pub events: Vec<String>,
    /// Rules, first match wins
    pub rules: Vec<SimulatorRule>,
    /// Holding/input register bank
    pub registers: Vec<u16>,
    /// Coil/discrete input bank
    pub coils: Vec<bool>,
    /// Delay before a response becomes readable
    pub latency_ms: u64,
}

impl SimulatorConfig {
    /// Answer every frame with `respond`
    pub fn with_rule(mut self, condition: MatchCondition, respond: ResponseAction) -> Self {
        self.rules.push(SimulatorRule {
            condition,
            respond,
            max_hits: None,
        });
        self
    }
}

enum Matcher {
    Bytes(Vec<u8>),
    Pattern(Vec<Option<u8>>),
    Text(String, bool),
    Regex(Regex),
    Length(usize, usize),
    Any,
}

impl Matcher {
    fn compile(condition: &MatchCondition) -> Result<Self, String> {
        Ok(match condition {
            MatchCondition::Exact { hex } => Self::Bytes(decode_hex(hex)?),
            MatchCondition::HexPattern { pattern } => Self::Pattern(
                pattern
                    .split_whitespace()
                    .map(|part| match part {
                        "*" | "??" => Ok(None),
                        _ => u8::from_str_radix(part, 16)
                            .map(Some)
                            .map_err(|_| format!("bad pattern byte {part:?}")),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            MatchCondition::Text { text, case_sensitive } => {
                if *case_sensitive {
                    Self::Text(text.clone(), true)
                } else {
                    Self::Text(text.to_lowercase(), false)
                }
            }
            MatchCondition::Regex { pattern } => Self::Regex(Regex::new(pattern).map_err(|e| e.to_string())?),
            MatchCondition::LengthRange { min, max } => Self::Length(*min, *max),
            MatchCondition::Any => Self::Any,
        })
    }

    fn matches(&self, data: &[u8]) -> bool {
        match self {
            Self::Bytes(bytes) => data == bytes.as_slice(),
            Self::Pattern(parts) => {
                data.len() >= parts.len()
                    && parts
                        .iter()
                        .zip(data)
                        .all(|(part, byte)| part.map_or(true, |expected| expected == *byte))
            }
            Self::Text(text, true) => String::from_utf8_lossy(data).contains(text.as_str()),
            Self::Text(text, false) => String::from_utf8_lossy(data).to_lowercase().contains(text.as_str()),
            Self::Regex(re) => re.is_match(&String::from_utf8_lossy(data)),
            Self::Length(min, max) => (*min..=*max).contains(&data.len()),
            Self::Any => true,
        }
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    let compact: String = text.split_whitespace().collect();
    hex::decode(compact).map_err(|e| format!("bad hex {text:?}: {e}"))
}

struct SimState {
    rx: BytesMut,
    pending: VecDeque<(Instant, Vec<u8>)>,
    events: VecDeque<Event>,
    written: Vec<Vec<u8>>,
    hits: Vec<usize>,
    registers: Vec<u16>,
    coils: Vec<bool>,
    closed: bool,
}

impl SimState {
    fn promote_pending(&mut self) {
        let now = Instant::now();
        while self.pending.front().is_some_and(|(ready, _)| *ready <= now) {
            if let Some((_, data)) = self.pending.pop_front() {
                self.rx.extend_from_slice(&data);
            }
        }
    }
}

/// Host-side view of a running simulator
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    /// Frames written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    /// Make bytes readable immediately
    pub fn push_bytes(&self, data: &[u8]) {
        self.state.lock().rx.extend_from_slice(data);
    }

    /// Queue an event for `read_event`
    pub fn push_event(&self, name: &str, payload: Value) {
        self.state
            .lock()
            .events
            .push_back(Event::new(name, EventSource::Channel).with_payload(payload));
    }

    /// Current register bank
    pub fn registers(&self) -> Vec<u16> {
        self.state.lock().registers.clone()
    }

    /// Current coil bank
    pub fn coils(&self) -> Vec<bool> {
        self.state.lock().coils.clone()
    }
}

/// In-memory channel driven by [`SimulatorConfig`]
pub struct SimulatedChannel {
    rules: Vec<(Matcher, SimulatorRule)>,
    latency: Duration,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedChannel {
    /// Build the simulator; fails on malformed hex or regex in the rules
    pub fn new(config: SimulatorConfig) -> Result<Self, ChannelError> {
        let open_err = |message: String| ChannelError::Open {
            target: "simulator".into(),
            message,
        };
        let rules = config
            .rules
            .iter()
            .map(|rule| Ok((Matcher::compile(&rule.condition)?, rule.clone())))
            .collect::<Result<Vec<_>, String>>()
            .map_err(open_err)?;
        for rule in &config.rules {
            if let ResponseAction::SendHex { hex } = &rule.respond {
                decode_hex(hex).map_err(open_err)?;
            }
        }
        let preload = match &config.preload {
            Some(hex) => decode_hex(hex).map_err(open_err)?,
            None => Vec::new(),
        };

        let state = SimState {
            rx: BytesMut::from(preload.as_slice()),
            pending: VecDeque::new(),
            events: config
                .events
                .iter()
                .map(|name| Event::new(name.as_str(), EventSource::Channel))
                .collect(),
            written: Vec::new(),
            hits: vec![0; rules.len()],
            registers: config.registers.clone(),
            coils: config.coils.clone(),
            closed: false,
        };
        Ok(Self {
            rules,
            latency: Duration::from_millis(config.latency_ms),
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Handle for inspecting and feeding this simulator
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: self.state.clone(),
        }
    }

    fn respond(action: &ResponseAction, data: &[u8], state: &mut SimState) -> Option<Vec<u8>> {
        match action {
            ResponseAction::SendHex { hex } => decode_hex(hex).ok(),
            ResponseAction::SendText { text } => Some(text.as_bytes().to_vec()),
            ResponseAction::Echo => Some(data.to_vec()),
            ResponseAction::None => None,
            ResponseAction::Modbus { framing, unit_id } => modbus_reply(*framing, *unit_id, data, state),
        }
    }
}

fn modbus_reply(framing: ModbusFraming, only_unit: Option<u8>, frame: &[u8], state: &mut SimState) -> Option<Vec<u8>> {
    let (unit, pdu, tid) = match framing {
        ModbusFraming::Rtu => {
            let (unit, pdu) = modbus_rtu::decode_frame(frame).ok()?;
            (unit, pdu.to_vec(), 0)
        }
        ModbusFraming::Ascii => {
            let (unit, pdu) = modbus_ascii::decode_frame(frame).ok()?;
            (unit, pdu, 0)
        }
        ModbusFraming::Tcp => {
            let header = MbapHeader::from_bytes(frame)?;
            (header.unit_id, frame[MBAP_LEN..].to_vec(), header.transaction_id)
        }
    };
    if only_unit.is_some_and(|id| id != unit) {
        return None;
    }

    let response = match ModbusRequest::decode_pdu(&pdu) {
        Ok(request) => serve(&request, state),
        Err(_) => ModbusResponse::Exception {
            function: pdu.first().copied().unwrap_or(0) & 0x7F,
            code: ExceptionCode::IllegalFunction as u8,
        },
    };
    let pdu = response.encode_pdu();
    Some(match framing {
        ModbusFraming::Rtu => modbus_rtu::encode_frame(unit, &pdu),
        ModbusFraming::Ascii => modbus_ascii::encode_frame(unit, &pdu),
        ModbusFraming::Tcp => crate::core::protocol::modbus_tcp::encode_frame(tid, unit, &pdu),
    })
}

fn serve(request: &ModbusRequest, state: &mut SimState) -> ModbusResponse {
    let start = usize::from(request.address);
    let end = start + request.values.len();
    match request.function {
        FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils => {
            if end > state.coils.len() {
                return ModbusResponse::exception(request.function, ExceptionCode::IllegalDataAddress);
            }
            for (slot, value) in state.coils[start..end].iter_mut().zip(&request.values) {
                *slot = *value != 0;
            }
        }
        FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => {
            if end > state.registers.len() {
                return ModbusResponse::exception(request.function, ExceptionCode::IllegalDataAddress);
            }
            state.registers[start..end].copy_from_slice(&request.values);
        }
        _ => {}
    }
    ModbusResponse::for_request(request, &state.registers, &state.coils)
}

impl Channel for SimulatedChannel {
    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.written.push(data.to_vec());

        let matched = self.rules.iter().enumerate().find(|(i, (matcher, rule))| {
            rule.max_hits.map_or(true, |max| state.hits[*i] < max) && matcher.matches(data)
        });
        if let Some((index, (_, rule))) = matched {
            state.hits[index] += 1;
            if let Some(reply) = Self::respond(&rule.respond, data, &mut state) {
                tracing::trace!(rule = index, reply = %hex::encode_upper(&reply), "simulator reply");
                let ready = Instant::now() + self.latency;
                state.pending.push_back((ready, reply));
            }
        }
        Ok(())
    }

    fn read(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                state.promote_pending();
                let now = Instant::now();
                if state.rx.len() >= size || now >= deadline {
                    let n = size.min(state.rx.len());
                    return Ok(state.rx.split_to(n).to_vec());
                }
            }
            std::thread::sleep(POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn read_event(&mut self, timeout: Duration) -> Result<Option<Event>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                if let Some(event) = state.events.pop_front() {
                    return Ok(Some(event));
                }
                state.promote_pending();
                if let Some(pos) = state.rx.iter().position(|b| *b == b'\n') {
                    let line = state.rx.split_to(pos + 1).to_vec();
                    return Ok(Some(Event::from_channel_bytes(line)));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            std::thread::sleep(POLL.min(remaining));
        }
    }

    fn clear_input(&mut self) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        state.promote_pending();
        state.rx.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulator({} rules)", self.rules.len())
    }
}
