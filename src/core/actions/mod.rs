//! Action registry and built-in actions
//!
//! Actions are named closures invoked by the executor with the run's
//! [`RuntimeContext`] and the action's raw (unevaluated) arguments. Each
//! action decides which arguments go through expression evaluation.

mod builtin;
mod chart;
mod data;
mod protocol;
mod record;

use crate::core::error::EngineError;
use crate::core::runtime::RuntimeContext;
use crate::core::value::{Args, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared action closure
pub type ActionFn = Arc<dyn Fn(&mut RuntimeContext, &Args) -> Result<Value, EngineError> + Send + Sync>;

/// Maps action names to closures. Built once before a run and shared read-only.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, ActionFn>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.actions.keys()).finish()
    }
}

impl ActionRegistry {
    /// Registry without actions
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in action
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        builtin::register(&mut registry);
        data::register(&mut registry);
        protocol::register(&mut registry);
        chart::register(&mut registry);
        record::register(&mut registry);
        registry
    }

    /// Register or replace an action
    pub fn register<F>(&mut self, name: &str, action: F)
    where
        F: Fn(&mut RuntimeContext, &Args) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        self.actions.insert(name.to_string(), Arc::new(action));
    }

    /// Look up an action
    pub fn get(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(name).cloned()
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

/// First present, non-null argument among `keys`
pub(crate) fn arg<'a>(args: &'a Args, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| args.get(*k).filter(|v| !v.is_null()))
}

/// Evaluated argument
pub(crate) fn eval_arg(ctx: &RuntimeContext, args: &Args, keys: &[&str]) -> Result<Option<Value>, EngineError> {
    arg(args, keys).map(|v| ctx.evaluate(v)).transpose().map_err(Into::into)
}

/// Every argument evaluated
pub(crate) fn eval_args(ctx: &RuntimeContext, args: &Args) -> Result<Args, EngineError> {
    args.iter()
        .map(|(k, v)| Ok((k.clone(), ctx.evaluate(v)?)))
        .collect()
}

/// Evaluated argument as an integer
pub(crate) fn int_arg(ctx: &RuntimeContext, action: &str, args: &Args, keys: &[&str]) -> Result<Option<i64>, EngineError> {
    match eval_arg(ctx, args, keys)? {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| EngineError::invalid_argument(action, format!("{} must be a number, got {v}", keys[0]))),
    }
}

/// Store `value` under the `save_as` argument, when given
pub(crate) fn save_as(ctx: &mut RuntimeContext, args: &Args, value: &Value) {
    if let Some(name) = arg(args, &["save_as"]).and_then(Value::as_str) {
        ctx.set_var(name, value.clone());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::core::runtime::{ContextConfig, RuntimeContext};
    use crate::core::value::{Args, Value};
    use std::time::Duration;

    pub(crate) fn context() -> RuntimeContext {
        RuntimeContext::with_builtins(ContextConfig {
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        })
    }

    pub(crate) fn args<const N: usize>(entries: [(&str, Value); N]) -> Args {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ActionRegistry::with_builtins();
        for name in [
            "set", "log", "wait", "wait_for_event", "send", "if", "list_filter", "list_map",
            "modbus_read", "modbus_write", "modbus_request", "xmodem_send", "ymodem_send",
            "send_xmodem_block", "send_eot", "scpi_command", "at_command", "chart_add",
            "chart_add3d", "record_start", "record_stop",
        ] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[test]
    fn test_custom_action() {
        let mut registry = ActionRegistry::empty();
        registry.register("double", |ctx, args| {
            let n = int_arg(ctx, "double", args, &["n"])?.unwrap_or(0);
            Ok(Value::Int(n * 2))
        });
        let action = registry.get("double").unwrap();
        let mut ctx = context();
        ctx.set_var("x", Value::Int(4));
        assert_eq!(action(&mut ctx, &args([("n", Value::from("$x"))])).unwrap(), Value::Int(8));
    }
}
