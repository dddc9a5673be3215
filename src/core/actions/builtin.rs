//! Core actions: variables, logging, waits, raw sends, inline conditionals

use super::{arg, eval_arg, int_arg, ActionRegistry};
use crate::core::dsl::parser::parse_actions;
use crate::core::error::EngineError;
use crate::core::expression::{self, ExpressionError};
use crate::core::protocol::param_terminator;
use crate::core::runtime::RuntimeContext;
use crate::core::value::{Args, Value};
use std::time::{Duration, Instant};
use tracing::Level;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("set", set);
    registry.register("log", log);
    registry.register("wait", wait);
    registry.register("wait_for_event", wait_for_event);
    registry.register("send", send);
    registry.register("if", if_action);
}

/// Assign each key in declared order; later values see earlier assignments
fn set(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let mut assigned = Args::new();
    for (name, raw) in args {
        let value = ctx.evaluate(raw)?;
        ctx.set_var(name.clone(), value.clone());
        assigned.insert(name.clone(), value);
    }
    Ok(Value::Map(assigned))
}

fn parse_level(text: &str) -> Option<Level> {
    match text.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "critical" => Some(Level::ERROR),
        _ => None,
    }
}

fn log(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    // a message that is not a whole expression is treated as a template
    let message = match arg(args, &["message", "msg"]) {
        Some(Value::Str(text)) if expression::is_expression(text) => {
            let env = ctx.snapshot();
            match expression::evaluate(text, &env) {
                Ok(value) => value.to_string(),
                Err(ExpressionError::Syntax { .. }) => expression::interpolate(text, &env)?,
                Err(e) => return Err(e.into()),
            }
        }
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let level = match arg(args, &["level"]).and_then(Value::as_str) {
        Some(text) => parse_level(text)
            .ok_or_else(|| EngineError::invalid_argument("log", format!("unknown level: {text}")))?,
        None => Level::INFO,
    };
    ctx.log(level, &message)?;
    Ok(Value::Str(message))
}

fn duration_ms(action: &str, ms: i64) -> Result<Duration, EngineError> {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| EngineError::invalid_argument(action, format!("negative duration: {ms}")))
}

fn wait(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let ms = int_arg(ctx, "wait", args, &["ms", "duration"])?
        .ok_or_else(|| EngineError::invalid_argument("wait", "ms is required"))?;
    ctx.sleep(duration_ms("wait", ms)?)?;
    Ok(Value::Int(ms))
}

fn wait_for_event(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let wanted: Vec<String> = match eval_arg(ctx, args, &["event", "events", "name"])? {
        None => Vec::new(),
        Some(Value::List(items)) => items.iter().map(Value::to_string).collect(),
        Some(other) => vec![other.to_string()],
    };
    let deadline = match int_arg(ctx, "wait_for_event", args, &["timeout"])? {
        Some(ms) => Some(Instant::now() + duration_ms("wait_for_event", ms)?),
        None => None,
    };
    let poll = ctx.config().poll_interval;

    loop {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(Value::map([("event", Value::Null), ("timed_out", Value::Bool(true))]));
                }
                remaining.min(poll)
            }
            None => poll,
        };
        let Some(event) = ctx.next_event(slice)? else {
            continue;
        };
        if wanted.is_empty() || wanted.iter().any(|w| *w == event.name) {
            if let Some(name) = arg(args, &["save_as"]).and_then(Value::as_str) {
                ctx.set_var(name, event.value());
            }
            return Ok(Value::map([
                ("event", Value::from(event.name.as_str())),
                ("timed_out", Value::Bool(false)),
                ("payload", event.payload.clone()),
            ]));
        }
        tracing::debug!(event = %event.name, "ignoring unexpected event");
    }
}

fn send(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let mut data = if let Some(hex_text) = eval_arg(ctx, args, &["hex"])? {
        let compact: String = hex_text.to_string().split_whitespace().collect();
        hex::decode(&compact).map_err(|e| EngineError::invalid_argument("send", format!("invalid hex: {e}")))?
    } else {
        eval_arg(ctx, args, &["data", "text"])?
            .and_then(|v| v.to_bytes())
            .ok_or_else(|| EngineError::invalid_argument("send", "data or hex is required"))?
    };
    if args.contains_key("terminator") {
        data.extend(param_terminator(args, b""));
    }
    let channel = eval_arg(ctx, args, &["channel"])?.map(|v| v.to_string());
    ctx.write_to_channel(channel.as_deref(), &data)?;
    Ok(Value::from(data.len()))
}

fn if_action(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let guard = arg(args, &["when", "cond"]).ok_or_else(|| EngineError::invalid_argument("if", "when is required"))?;
    let taken = ctx.evaluate_guard(guard)?;
    let (branch, keys) = if taken {
        ("then", ["then", "do"])
    } else {
        ("else", ["else", "otherwise"])
    };
    let actions = match arg(args, &keys) {
        Some(items @ Value::List(_)) => parse_actions(items, &format!("if.{branch}"))?,
        Some(single) => parse_actions(&Value::List(vec![single.clone()]), &format!("if.{branch}"))?,
        None => Vec::new(),
    };
    for call in &actions {
        ctx.run_action(&call.name, &call.args)?;
    }
    Ok(Value::map([
        ("when", guard.clone()),
        ("taken", Value::from(branch)),
        ("count", Value::from(actions.len())),
    ]))
}
