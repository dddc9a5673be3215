//! Runtime context shared by the executor and actions

use super::event::{event_queue, CancelToken, Event, EventSender};
use super::recorder::{ActionOutcome, ExperimentRecorder};
use crate::core::actions::ActionRegistry;
use crate::core::channel::Channel;
use crate::core::dsl::ast::ChannelDecl;
use crate::core::error::EngineError;
use crate::core::expression::{self, ExpressionError};
use crate::core::protocol::{ProtocolDriver, ProtocolRegistry, RetryPolicy};
use crate::core::value::{Args, Value, Variables};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Level;

const LOG_TARGET: &str = "protoflow::script";

/// Tunables applied to every run
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    /// Granularity of event waits and cancellable sleeps
    pub poll_interval: Duration,
    /// Defaults for Modbus exchanges
    pub modbus: RetryPolicy,
    /// Parent directory for `record_start` without `dir`
    pub record_dir: PathBuf,
    /// Capacity of the external event queue
    pub event_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            modbus: RetryPolicy::default(),
            record_dir: PathBuf::from("logs/experiments"),
            event_capacity: 1024,
        }
    }
}

/// Live state of one run: variables, channels, drivers, events and recorder
pub struct RuntimeContext {
    vars: Variables,
    channels: BTreeMap<String, Box<dyn Channel>>,
    default_channel: Option<String>,
    drivers: HashMap<(String, String), Box<dyn ProtocolDriver>>,
    actions: Arc<ActionRegistry>,
    protocols: Arc<ProtocolRegistry>,
    last_event: Option<Event>,
    events_tx: EventSender,
    events_rx: Receiver<Event>,
    recorder: Option<ExperimentRecorder>,
    cancel: CancelToken,
    config: ContextConfig,
    script_text: Option<String>,
    script_path: Option<PathBuf>,
    closed: bool,
}

impl RuntimeContext {
    /// Context with no channels
    pub fn new(actions: Arc<ActionRegistry>, protocols: Arc<ProtocolRegistry>, config: ContextConfig) -> Self {
        let (events_tx, events_rx) = event_queue(config.event_capacity.max(1));
        Self {
            vars: Variables::new(),
            channels: BTreeMap::new(),
            default_channel: None,
            drivers: HashMap::new(),
            actions,
            protocols,
            last_event: None,
            events_tx,
            events_rx,
            recorder: None,
            cancel: CancelToken::new(),
            config,
            script_text: None,
            script_path: None,
            closed: false,
        }
    }

    /// Context with the built-in actions and drivers
    pub fn with_builtins(config: ContextConfig) -> Self {
        Self::new(
            Arc::new(ActionRegistry::with_builtins()),
            Arc::new(ProtocolRegistry::with_builtins()),
            config,
        )
    }

    /// Share a cancellation token with the host
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Token observed by waits and the executor
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Producer for external events consumed by `next_event`
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Run tunables
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Remember the script for recorder snapshots
    pub fn set_script(&mut self, text: Option<String>, path: Option<PathBuf>) {
        self.script_text = text;
        self.script_path = path;
    }

    /// Script source, if known
    pub fn script_text(&self) -> Option<&str> {
        self.script_text.as_deref()
    }

    /// Script path, if known
    pub fn script_path(&self) -> Option<&PathBuf> {
        self.script_path.as_ref()
    }

    // ---- variables ----

    /// All variables
    pub fn vars(&self) -> &Variables {
        &self.vars
    }

    /// Read a variable
    pub fn get_var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Assign a variable
    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Variables plus `event`, `event_name`, `event_payload` and their
    /// flattened identifier keys
    pub fn snapshot(&self) -> Variables {
        let mut snap = self.vars.clone();
        let (event, name, payload) = match &self.last_event {
            Some(e) => (e.value(), Value::from(e.name.as_str()), e.payload.clone()),
            None => (Value::Null, Value::Null, Value::Null),
        };
        flatten_into(&mut snap, "event", &event);
        flatten_into(&mut snap, "event_payload", &payload);
        snap.insert("event".into(), event);
        snap.insert("event_name".into(), name);
        snap.insert("event_payload".into(), payload);
        snap
    }

    /// Evaluate `$` expressions in `value` (recursing into lists and maps)
    /// against the current snapshot; other values pass through unchanged
    pub fn evaluate(&self, value: &Value) -> Result<Value, ExpressionError> {
        if !contains_expression(value) {
            return Ok(value.clone());
        }
        evaluate_in(value, &self.snapshot())
    }

    /// Evaluate a guard: strings are always parsed as expressions
    pub fn evaluate_guard(&self, guard: &Value) -> Result<bool, ExpressionError> {
        match guard {
            Value::Str(text) => Ok(expression::evaluate(text, &self.snapshot())?.is_truthy()),
            other => Ok(other.is_truthy()),
        }
    }

    // ---- actions ----

    /// Dispatch a registered action, recording exactly one action record
    pub fn run_action(&mut self, name: &str, args: &Args) -> Result<Value, EngineError> {
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| EngineError::UnknownAction(name.to_string()))?;
        tracing::debug!(action = name, "running action");

        let recorded_before = self.recorder.is_some();
        if recorded_before && name == "record_stop" {
            let stop = Value::map([("event", Value::from("stop"))]);
            self.record_action(name, args, ActionOutcome::Ok(&stop));
            return action(self, args);
        }

        let result = action(self, args);
        // a recorder attached during the call records the call that attached it
        match &result {
            Ok(value) => self.record_action(name, args, ActionOutcome::Ok(value)),
            Err(e) => {
                tracing::error!(action = name, error = %e, "action failed");
                self.record_action(
                    name,
                    args,
                    ActionOutcome::Err {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                );
            }
        }
        result
    }

    fn record_action(&mut self, name: &str, args: &Args, outcome: ActionOutcome<'_>) {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.record_action(name, args, outcome) {
                tracing::warn!(error = %e, "failed to record action");
            }
        }
    }

    // ---- events ----

    /// Last event returned by [`next_event`](Self::next_event)
    pub fn last_event(&self) -> Option<&Event> {
        self.last_event.as_ref()
    }

    /// Next event from the external queue, else from the default channel,
    /// waiting at most `timeout`
    pub fn next_event(&mut self, timeout: Duration) -> Result<Option<Event>, EngineError> {
        if let Ok(event) = self.events_rx.try_recv() {
            return Ok(Some(self.accept_event(event)?));
        }
        let event = match self.default_channel.clone() {
            Some(name) => self.channel_mut(Some(&name))?.read_event(timeout)?,
            None => match self.events_rx.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
        };
        event.map(|e| self.accept_event(e)).transpose()
    }

    fn accept_event(&mut self, event: Event) -> Result<Event, EngineError> {
        tracing::debug!(event = %event.name, source = event.source.as_str(), "event");
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record_event(&event.name, event.source.as_str(), &event.record_payload())?;
        }
        self.last_event = Some(event.clone());
        Ok(event)
    }

    /// Sleep for `duration`, waking every poll interval to observe cancellation
    pub fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            std::thread::sleep(remaining.min(self.config.poll_interval));
        }
    }

    // ---- channels and protocols ----

    /// Register an open channel; the first one becomes the default
    pub fn add_channel(&mut self, name: impl Into<String>, channel: Box<dyn Channel>) {
        let name = name.into();
        tracing::info!(channel = %name, target = %channel.describe(), "channel ready");
        if self.default_channel.is_none() {
            self.default_channel = Some(name.clone());
        }
        self.channels.insert(name, channel);
    }

    /// Open every declared channel; already opened ones are closed on failure
    pub fn open_channels(&mut self, decls: &[ChannelDecl]) -> Result<(), EngineError> {
        for decl in decls {
            match decl.config.open() {
                Ok(channel) => self.add_channel(decl.name.clone(), channel),
                Err(e) => {
                    tracing::error!(channel = %decl.name, error = %e, "failed to open channel");
                    self.close_channels();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Name of the default channel
    pub fn default_channel(&self) -> Option<&str> {
        self.default_channel.as_deref()
    }

    /// Channel names
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    fn resolve_channel(&self, name: Option<&str>) -> Result<String, EngineError> {
        match name.or(self.default_channel.as_deref()) {
            Some(n) if self.channels.contains_key(n) => Ok(n.to_string()),
            Some(n) => Err(EngineError::NoChannel(n.to_string())),
            None => Err(EngineError::NoChannel("<default>".into())),
        }
    }

    /// Named channel, or the default when `name` is `None`
    pub fn channel_mut(&mut self, name: Option<&str>) -> Result<&mut dyn Channel, EngineError> {
        let key = self.resolve_channel(name)?;
        match self.channels.get_mut(&key) {
            Some(channel) => Ok(channel.as_mut()),
            None => Err(EngineError::NoChannel(key)),
        }
    }

    /// Write raw bytes to a channel
    pub fn write_to_channel(&mut self, name: Option<&str>, data: &[u8]) -> Result<(), EngineError> {
        let channel = self.channel_mut(name)?;
        tracing::trace!(tx = %hex::encode_upper(data), "channel write");
        channel.write(data)?;
        Ok(())
    }

    /// Run one protocol exchange on a channel. Drivers are cached per
    /// (channel, protocol) so per-connection state such as Modbus TCP
    /// transaction ids survives across calls.
    pub fn execute_protocol(&mut self, channel: Option<&str>, protocol: &str, params: &Args) -> Result<Value, EngineError> {
        let key = self.resolve_channel(channel)?;
        let cache_key = (key.clone(), protocol.to_string());
        if !self.drivers.contains_key(&cache_key) {
            let driver = self.protocols.create(protocol)?;
            self.drivers.insert(cache_key.clone(), driver);
        }
        let (Some(driver), Some(channel)) = (self.drivers.get_mut(&cache_key), self.channels.get_mut(&key)) else {
            return Err(EngineError::NoChannel(key));
        };
        tracing::debug!(protocol, channel = %key, "protocol exchange");
        Ok(driver.execute(channel.as_mut(), params)?)
    }

    fn close_channels(&mut self) {
        self.drivers.clear();
        for (name, mut channel) in std::mem::take(&mut self.channels) {
            if let Err(e) = channel.close() {
                tracing::warn!(channel = %name, error = %e, "channel close failed");
            }
        }
        self.default_channel = None;
    }

    // ---- recorder ----

    /// Attach a started recorder, closing any previous one
    pub fn attach_recorder(&mut self, recorder: ExperimentRecorder) -> Result<(), EngineError> {
        if let Some(mut previous) = self.recorder.take() {
            previous.close(Some(&self.snapshot()))?;
        }
        self.recorder = Some(recorder);
        Ok(())
    }

    /// Detach the recorder without closing it
    pub fn detach_recorder(&mut self) -> Option<ExperimentRecorder> {
        self.recorder.take()
    }

    /// Close and detach the recorder with a final snapshot
    pub fn close_recorder(&mut self) -> Result<(), EngineError> {
        let snapshot = self.snapshot();
        if let Some(mut recorder) = self.recorder.take() {
            recorder.close(Some(&snapshot))?;
        }
        Ok(())
    }

    /// Attached recorder
    pub fn recorder(&self) -> Option<&ExperimentRecorder> {
        self.recorder.as_ref()
    }

    /// Record a state entry
    pub fn record_state(&mut self, name: &str) -> Result<(), EngineError> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record_state(name)?;
        }
        Ok(())
    }

    /// Record a chart point
    pub fn record_chart(&mut self, payload: &Value) -> Result<(), EngineError> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record_chart(payload)?;
        }
        Ok(())
    }

    /// Emit a script log line; `info` and above also go to the recorder
    pub fn log(&mut self, level: Level, message: &str) -> Result<(), EngineError> {
        match level {
            Level::TRACE => tracing::trace!(target: LOG_TARGET, "{message}"),
            Level::DEBUG => tracing::debug!(target: LOG_TARGET, "{message}"),
            Level::INFO => tracing::info!(target: LOG_TARGET, "{message}"),
            Level::WARN => tracing::warn!(target: LOG_TARGET, "{message}"),
            Level::ERROR => tracing::error!(target: LOG_TARGET, "{message}"),
        }
        if level <= Level::INFO {
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.record_log(level.as_str(), LOG_TARGET, message)?;
            }
        }
        Ok(())
    }

    /// Close the recorder (with a final snapshot) and every channel.
    /// Later calls do nothing.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let recorder = self.close_recorder();
        self.close_channels();
        recorder
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "context close on drop failed");
        }
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn flatten_into(snap: &mut Variables, prefix: &str, value: &Value) {
    if let Value::Map(map) = value {
        for (key, v) in map.iter().filter(|(k, _)| is_identifier(k)) {
            snap.insert(format!("{prefix}.{key}"), v.clone());
        }
    }
}

/// Expose `item`, `index` and flattened `item.<key>` for list actions
pub fn item_scope(base: &Variables, item: &Value, index: usize) -> Variables {
    let mut scope = base.clone();
    flatten_into(&mut scope, "item", item);
    scope.insert("item".into(), item.clone());
    scope.insert("index".into(), Value::from(index));
    scope
}

fn contains_expression(value: &Value) -> bool {
    match value {
        Value::Str(s) => expression::is_expression(s),
        Value::List(items) => items.iter().any(contains_expression),
        Value::Map(map) => map.values().any(contains_expression),
        _ => false,
    }
}

/// Evaluate `$` expressions inside `value` against `env`
pub fn evaluate_in(value: &Value, env: &Variables) -> Result<Value, ExpressionError> {
    match value {
        Value::Str(s) if expression::is_expression(s) => expression::evaluate(s, env),
        Value::List(items) => items
            .iter()
            .map(|v| evaluate_in(v, env))
            .collect::<Result<_, _>>()
            .map(Value::List),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), evaluate_in(v, env)?)))
            .collect::<Result<_, _>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{SimulatedChannel, SimulatorConfig};
    use crate::core::runtime::recorder::RecorderOptions;

    fn context() -> RuntimeContext {
        RuntimeContext::with_builtins(ContextConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        })
    }

    #[test]
    fn test_snapshot_flattens_event_payload() {
        let mut ctx = context();
        ctx.event_sender()
            .send("reading", Value::map([("temp", Value::Int(21)), ("bad key", Value::Int(0))]));
        let event = ctx.next_event(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(event.name, "reading");

        let snap = ctx.snapshot();
        assert_eq!(snap.get("event_name"), Some(&Value::from("reading")));
        assert_eq!(snap.get("event_payload.temp"), Some(&Value::Int(21)));
        assert_eq!(snap.get("event.temp"), Some(&Value::Int(21)));
        assert!(!snap.contains_key("event_payload.bad key"));
        assert_eq!(ctx.evaluate(&Value::from("$event_payload.temp + 1")).unwrap(), Value::Int(22));
    }

    #[test]
    fn test_evaluate_passes_plain_values() {
        let mut ctx = context();
        ctx.set_var("n", Value::Int(2));
        assert_eq!(ctx.evaluate(&Value::from("plain")).unwrap(), Value::from("plain"));
        assert_eq!(
            ctx.evaluate(&Value::List(vec![Value::from("$n * 2"), Value::Int(1)])).unwrap(),
            Value::List(vec![Value::Int(4), Value::Int(1)])
        );
        assert!(ctx.evaluate_guard(&Value::from("n == 2")).is_err());
        assert!(ctx.evaluate_guard(&Value::from("$n == 2")).unwrap());
    }

    #[test]
    fn test_unknown_action() {
        let mut ctx = context();
        assert!(matches!(
            ctx.run_action("nope", &Args::new()),
            Err(EngineError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_channel_event_fallback() {
        let mut ctx = context();
        let sim = SimulatedChannel::new(SimulatorConfig::default()).unwrap();
        let handle = sim.handle();
        ctx.add_channel("dev", Box::new(sim));
        handle.push_bytes(b"DONE\n");
        let event = ctx.next_event(Duration::from_millis(20)).unwrap().unwrap();
        assert_eq!(event.name, "DONE");
        assert!(ctx.next_event(Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(ctx.snapshot().get("event"), Some(&Value::bytes(b"DONE\n".to_vec())));
    }

    #[test]
    fn test_missing_channel() {
        let mut ctx = context();
        assert!(matches!(
            ctx.write_to_channel(None, b"x"),
            Err(EngineError::NoChannel(_))
        ));
    }

    #[test]
    fn test_cancelled_sleep() {
        let ctx = context();
        ctx.cancel_token().cancel();
        assert!(matches!(ctx.sleep(Duration::from_secs(5)), Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_close_writes_snapshot_and_closes_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context();
        ctx.add_channel("dev", Box::new(SimulatedChannel::new(SimulatorConfig::default()).unwrap()));
        let mut recorder = ExperimentRecorder::new(RecorderOptions {
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        recorder.start().unwrap();
        let paths = recorder.paths().unwrap().clone();
        ctx.attach_recorder(recorder).unwrap();
        ctx.set_var("answer", Value::Int(42));
        ctx.close().unwrap();
        ctx.close().unwrap();

        let snapshot: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(paths.vars_snapshot).unwrap()).unwrap();
        assert_eq!(snapshot["answer"], 42);
        assert_eq!(ctx.channel_names().count(), 0);
    }
}
