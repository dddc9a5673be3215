//! List filtering and mapping over script variables

use super::{arg, int_arg, ActionRegistry};
use crate::core::error::EngineError;
use crate::core::expression;
use crate::core::runtime::{item_scope, RuntimeContext};
use crate::core::value::{Args, Value};

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("list_filter", |ctx, args| transform(ctx, args, "list_filter", false));
    registry.register("list_map", |ctx, args| transform(ctx, args, "list_map", true));
}

/// Source list: a bare string names a variable, anything else is evaluated
fn source(ctx: &RuntimeContext, action: &str, args: &Args) -> Result<Vec<Value>, EngineError> {
    let raw = arg(args, &["src", "items", "in"])
        .ok_or_else(|| EngineError::invalid_argument(action, "src is required"))?;
    let value = match raw {
        Value::Str(name) if !expression::is_expression(name) => ctx
            .get_var(name)
            .cloned()
            .ok_or_else(|| EngineError::invalid_argument(action, format!("unknown variable: {name}")))?,
        other => ctx.evaluate(other)?,
    };
    match value {
        Value::List(items) => Ok(items),
        other => Err(EngineError::invalid_argument(
            action,
            format!("src must be a list, got {}", other.type_name()),
        )),
    }
}

fn transform(ctx: &mut RuntimeContext, args: &Args, action: &str, map: bool) -> Result<Value, EngineError> {
    let items = source(ctx, action, args)?;
    let filter = arg(args, &["where", "when"]).map(Value::to_string);
    let mapper = arg(args, &["expr", "map", "value"]).map(Value::to_string);
    if map && mapper.is_none() {
        return Err(EngineError::invalid_argument(action, "expr is required"));
    }
    if !map && filter.is_none() {
        return Err(EngineError::invalid_argument(action, "where is required"));
    }
    let limit = match int_arg(ctx, action, args, &["limit"])? {
        Some(n) => Some(usize::try_from(n).map_err(|_| EngineError::invalid_argument(action, "limit must be >= 0"))?),
        None => None,
    };

    let base = ctx.snapshot();
    let mut out = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        if limit.is_some_and(|l| out.len() >= l) {
            break;
        }
        let scope = item_scope(&base, &item, index);
        if let Some(filter) = &filter {
            if !expression::evaluate(filter, &scope)?.is_truthy() {
                continue;
            }
        }
        match &mapper {
            Some(mapper) => out.push(expression::evaluate(mapper, &scope)?),
            None => out.push(item),
        }
    }

    let result = Value::List(out);
    if let Some(dst) = arg(args, &["dst", "out"]).and_then(Value::as_str) {
        ctx.set_var(dst, result.clone());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{args, context};
    use super::*;

    fn readings() -> Value {
        Value::List(
            [1, 5, 9]
                .into_iter()
                .map(|v| Value::map([("v", Value::Int(v))]))
                .collect(),
        )
    }

    #[test]
    fn test_filter_with_limit() {
        let mut ctx = context();
        ctx.set_var("rows", readings());
        let all = ctx
            .run_action("list_filter", &args([("src", Value::from("rows")), ("where", Value::from("$item.v > 3"))]))
            .unwrap();
        assert_eq!(all.as_list().map(<[Value]>::len), Some(2));

        let first = ctx
            .run_action(
                "list_filter",
                &args([
                    ("src", Value::from("$rows")),
                    ("where", Value::from("$item.v > 3")),
                    ("limit", Value::Int(1)),
                    ("dst", Value::from("hot")),
                ]),
            )
            .unwrap();
        assert_eq!(first, Value::List(vec![Value::map([("v", Value::Int(5))])]));
        assert_eq!(ctx.get_var("hot"), Some(&first));
    }

    #[test]
    fn test_map_with_index() {
        let mut ctx = context();
        ctx.set_var("rows", readings());
        let mapped = ctx
            .run_action(
                "list_map",
                &args([("src", Value::from("rows")), ("expr", Value::from("$item.v * 10 + $index"))]),
            )
            .unwrap();
        assert_eq!(mapped, Value::List(vec![Value::Int(10), Value::Int(51), Value::Int(92)]));
    }

    #[test]
    fn test_non_list_source() {
        let mut ctx = context();
        ctx.set_var("n", Value::Int(1));
        let err = ctx
            .run_action("list_map", &args([("src", Value::from("n")), ("expr", Value::from("$item"))]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }
}
