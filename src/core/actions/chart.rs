//! Chart data points, recorded to the charts stream

use super::{arg, eval_arg, ActionRegistry};
use crate::core::error::EngineError;
use crate::core::runtime::RuntimeContext;
use crate::core::value::{Args, Value};
use chrono::Utc;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("chart_add", chart_add);
    registry.register("chart_add3d", chart_add3d);
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

fn timestamp(ctx: &RuntimeContext, action: &str, args: &Args) -> Result<f64, EngineError> {
    match eval_arg(ctx, args, &["ts", "timestamp"])? {
        None => Ok(now_seconds()),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| EngineError::invalid_argument(action, format!("ts must be a number, got {v}"))),
    }
}

fn chart_add(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let bind = arg(args, &["bind"])
        .map(Value::to_string)
        .ok_or_else(|| EngineError::invalid_argument("chart_add", "bind is required"))?;
    let value = eval_arg(ctx, args, &["value", "val"])?
        .ok_or_else(|| EngineError::invalid_argument("chart_add", "value is required"))?;
    let value = value
        .as_f64()
        .ok_or_else(|| EngineError::invalid_argument("chart_add", format!("value must be numeric, got {value}")))?;
    let ts = timestamp(ctx, "chart_add", args)?;

    let point = Value::map([
        ("ts", Value::Float(ts)),
        ("bind", Value::from(bind.as_str())),
        ("value", Value::Float(value)),
    ]);
    ctx.record_chart(&point)?;
    Ok(point)
}

fn chart_add3d(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let mut point = Args::new();
    for (axis, bind_key) in [("x", "bind_x"), ("y", "bind_y"), ("z", "bind_z")] {
        let value = eval_arg(ctx, args, &[axis])?
            .ok_or_else(|| EngineError::invalid_argument("chart_add3d", "x, y and z are required"))?;
        let bind = arg(args, &[bind_key]).map_or_else(|| axis.to_string(), Value::to_string);
        point.insert(bind, value);
    }
    point.insert("ts".into(), Value::Float(timestamp(ctx, "chart_add3d", args)?));
    let point = Value::Map(point);
    ctx.record_chart(&point)?;
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{args, context};
    use super::*;

    #[test]
    fn test_chart_add_evaluates_value() {
        let mut ctx = context();
        ctx.set_var("temp", Value::Int(21));
        let point = ctx
            .run_action(
                "chart_add",
                &args([("bind", Value::from("temp")), ("value", Value::from("$temp * 2")), ("ts", Value::Int(5))]),
            )
            .unwrap();
        assert_eq!(point.get("value"), Some(&Value::Float(42.0)));
        assert_eq!(point.get("ts"), Some(&Value::Float(5.0)));
    }

    #[test]
    fn test_chart_add3d_custom_binds() {
        let mut ctx = context();
        let point = ctx
            .run_action(
                "chart_add3d",
                &args([
                    ("x", Value::Int(1)),
                    ("y", Value::Int(2)),
                    ("z", Value::Int(3)),
                    ("bind_z", Value::from("depth")),
                ]),
            )
            .unwrap();
        assert_eq!(point.get("depth"), Some(&Value::Int(3)));
        assert_eq!(point.get("x"), Some(&Value::Int(1)));
        assert!(ctx.run_action("chart_add3d", &args([("x", Value::Int(1))])).is_err());
    }
}
