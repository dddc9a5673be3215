//! Events, the external event queue and cooperative cancellation

use crate::core::value::Value;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Host application via [`EventSender`]
    Bus,
    /// Read from a channel
    Channel,
}

impl EventSource {
    /// Recorder label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bus => "bus",
            Self::Channel => "channel",
        }
    }
}

/// A named event with optional payload
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Name matched against `on_event` keys
    pub name: String,
    /// Structured payload
    pub payload: Value,
    /// Raw bytes for channel line events
    pub raw: Option<Vec<u8>>,
    /// Origin
    pub source: EventSource,
}

impl Event {
    /// Event without payload
    pub fn new(name: impl Into<String>, source: EventSource) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            raw: None,
            source,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Event for a line received on a channel; the name is the trimmed text
    pub fn from_channel_bytes(raw: Vec<u8>) -> Self {
        let name = String::from_utf8_lossy(&raw).trim().to_string();
        Self {
            name,
            payload: Value::Null,
            raw: Some(raw),
            source: EventSource::Channel,
        }
    }

    /// Value bound to `$event`: raw bytes, else the payload, else the name
    pub fn value(&self) -> Value {
        match (&self.raw, &self.payload) {
            (Some(raw), _) => Value::bytes(raw.clone()),
            (None, Value::Null) => Value::from(self.name.as_str()),
            (None, payload) => payload.clone(),
        }
    }

    /// Payload written to the recorder's event stream
    pub fn record_payload(&self) -> Value {
        match &self.raw {
            Some(raw) => Value::map([
                ("text", Value::from(String::from_utf8_lossy(raw).into_owned())),
                ("hex", Value::from(hex::encode_upper(raw))),
            ]),
            None => self.payload.clone(),
        }
    }
}

/// Create the bounded queue feeding a context's `next_event`
pub fn event_queue(capacity: usize) -> (EventSender, Receiver<Event>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (EventSender { tx }, rx)
}

/// Producer half of the event queue, cloneable across threads
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    /// Queue an event; returns false when the queue is full or the run ended
    pub fn send(&self, name: impl Into<String>, payload: Value) -> bool {
        let event = Event::new(name, EventSource::Bus).with_payload(payload);
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(event = %event.name, "event queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Cooperative stop flag shared between a run and its host
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_event() {
        let event = Event::from_channel_bytes(b"READY\r\n".to_vec());
        assert_eq!(event.name, "READY");
        assert_eq!(event.value(), Value::bytes(b"READY\r\n".to_vec()));
        assert_eq!(event.record_payload().get("hex"), Some(&Value::from("52454144590D0A")));
    }

    #[test]
    fn test_event_value_prefers_payload() {
        let plain = Event::new("go", EventSource::Bus);
        assert_eq!(plain.value(), Value::from("go"));
        let rich = plain.with_payload(Value::map([("v", Value::Int(1))]));
        assert_eq!(rich.value().get("v"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_queue_and_cancel() {
        let (tx, rx) = event_queue(1);
        assert!(tx.send("a", Value::Null));
        assert!(!tx.send("b", Value::Null));
        assert_eq!(rx.try_recv().unwrap().name, "a");

        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
