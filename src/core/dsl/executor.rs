//! State-machine executor
//!
//! Runs a [`ScriptAst`] against a [`RuntimeContext`]: enter a state, run its
//! actions in order, then pick the next state from `goto`/`when`, from
//! `on_event`/`timeout`, or stop.

use super::ast::{ScriptAst, State, TERMINAL_STATE};
use crate::core::error::EngineError;
use crate::core::runtime::RuntimeContext;
use std::time::{Duration, Instant};

/// What a finished run went through
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    /// Entered states, in order (repeats included)
    pub visited: Vec<String>,
    /// Last entered state
    pub final_state: Option<String>,
    /// Number of transitions taken
    pub transitions: usize,
    /// Wall time of the run
    pub elapsed: Duration,
}

type Observer<'a> = Box<dyn FnMut(&str) + 'a>;

/// Drives one script
pub struct Executor<'a> {
    script: &'a ScriptAst,
    observer: Option<Observer<'a>>,
}

impl<'a> Executor<'a> {
    /// Executor for `script`
    pub fn new(script: &'a ScriptAst) -> Self {
        Self { script, observer: None }
    }

    /// Call `observer` with each entered state name
    pub fn with_observer(mut self, observer: impl FnMut(&str) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Run from the initial state until no transition applies
    pub fn run(&mut self, ctx: &mut RuntimeContext) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        let mut current = self.script.state_machine.initial.clone();

        loop {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let state = self
                .script
                .state_machine
                .states
                .get(&current)
                .ok_or_else(|| EngineError::UnknownState(current.clone()))?;

            self.enter(ctx, state, &mut summary)?;
            for call in &state.actions {
                if ctx.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                ctx.run_action(&call.name, &call.args)?;
            }
            if state.name == TERMINAL_STATE {
                break;
            }

            let next = if let Some(goto) = &state.goto {
                match &state.when {
                    Some(guard) if !ctx.evaluate_guard(guard)? => state.else_goto.clone(),
                    _ => Some(goto.clone()),
                }
            } else if state.waits() {
                wait_transition(ctx, state)?
            } else {
                None
            };

            match next {
                // an undeclared `done` ends the run like a declared one
                Some(target) if target == TERMINAL_STATE && !self.script.state_machine.states.contains_key(&target) => {
                    tracing::debug!(from = %state.name, "transition to implicit terminal state");
                    summary.transitions += 1;
                    break;
                }
                Some(target) => {
                    tracing::debug!(from = %state.name, to = %target, "transition");
                    summary.transitions += 1;
                    current = target;
                }
                None => break,
            }
        }

        summary.elapsed = started.elapsed();
        tracing::info!(
            final_state = summary.final_state.as_deref().unwrap_or(""),
            transitions = summary.transitions,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "state machine finished"
        );
        Ok(summary)
    }

    fn enter(&mut self, ctx: &mut RuntimeContext, state: &State, summary: &mut RunSummary) -> Result<(), EngineError> {
        tracing::info!(state = %state.name, "enter state");
        if let Some(observer) = self.observer.as_mut() {
            observer(&state.name);
        }
        ctx.record_state(&state.name)?;
        summary.visited.push(state.name.clone());
        summary.final_state = Some(state.name.clone());
        Ok(())
    }
}

/// Block until a mapped event arrives or the state's timeout elapses.
/// Unmapped events are consumed and ignored.
fn wait_transition(ctx: &mut RuntimeContext, state: &State) -> Result<Option<String>, EngineError> {
    let deadline = state.timeout.map(|t| Instant::now() + t);
    let poll = ctx.config().poll_interval;
    loop {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::debug!(state = %state.name, "state timeout");
                    return Ok(state.on_timeout.clone());
                }
                remaining.min(poll)
            }
            None => poll,
        };
        if let Some(event) = ctx.next_event(slice)? {
            if let Some(target) = state.on_event.get(&event.name) {
                return Ok(Some(target.clone()));
            }
            tracing::debug!(state = %state.name, event = %event.name, "unhandled event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dsl::parser::parse;
    use crate::core::runtime::ContextConfig;
    use crate::core::value::Value;

    fn context() -> RuntimeContext {
        RuntimeContext::with_builtins(ContextConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        })
    }

    #[test]
    fn test_goto_chain_visits_each_state() {
        let script = parse(
            r#"
state_machine:
  initial: A
  states:
    A: { goto: B }
    B: {}
"#,
        )
        .unwrap();
        let mut seen = Vec::new();
        let summary = Executor::new(&script)
            .with_observer(|s| seen.push(s.to_string()))
            .run(&mut context())
            .unwrap();
        assert_eq!(summary.visited, ["A", "B"]);
        assert_eq!(summary.transitions, 1);
        assert_eq!(seen, ["A", "B"]);
    }

    #[test]
    fn test_guard_selects_branch() {
        let script = parse(
            r#"
vars: { n: 0 }
state_machine:
  initial: loop
  states:
    loop:
      actions:
        - set: { n: "$n + 1" }
      when: "$n < 3"
      goto: loop
      else_goto: done
    done:
      actions:
        - log: "finished at $n"
"#,
        )
        .unwrap();
        let mut ctx = context();
        ctx.set_var("n", Value::Int(0));
        let summary = Executor::new(&script).run(&mut ctx).unwrap();
        assert_eq!(ctx.get_var("n"), Some(&Value::Int(3)));
        assert_eq!(summary.final_state.as_deref(), Some("done"));
        assert_eq!(summary.visited.len(), 4);
    }

    #[test]
    fn test_unknown_goto_target_fails() {
        let script = parse(
            r#"
state_machine:
  initial: A
  states:
    A: { goto: nowhere }
"#,
        )
        .unwrap();
        let err = Executor::new(&script).run(&mut context()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownState(s) if s == "nowhere"));
    }

    #[test]
    fn test_undeclared_done_ends_run() {
        let script = parse("state_machine:\n  initial: A\n  states:\n    A: { goto: done }\n").unwrap();
        let summary = Executor::new(&script).run(&mut context()).unwrap();
        assert_eq!(summary.visited, ["A"]);
        assert_eq!(summary.final_state.as_deref(), Some("A"));
        assert!(script.dangling_targets().is_empty());
    }

    #[test]
    fn test_timeout_never_fires_early() {
        let script = parse(
            r#"
state_machine:
  initial: wait
  states:
    wait:
      timeout: 120
      on_event: { go: fast }
      on_timeout: slow
    fast: {}
    slow: {}
"#,
        )
        .unwrap();
        let started = Instant::now();
        let summary = Executor::new(&script).run(&mut context()).unwrap();
        let elapsed = started.elapsed();
        assert_eq!(summary.final_state.as_deref(), Some("slow"));
        assert!(elapsed >= Duration::from_millis(120));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[test]
    fn test_event_transition() {
        let script = parse(
            r#"
state_machine:
  initial: wait
  states:
    wait:
      timeout: 2000
      on_event: { go: fast }
      on_timeout: slow
    fast: {}
    slow: {}
"#,
        )
        .unwrap();
        let mut ctx = context();
        ctx.event_sender().send("other", Value::Null);
        ctx.event_sender().send("go", Value::Null);
        let summary = Executor::new(&script).run(&mut ctx).unwrap();
        assert_eq!(summary.final_state.as_deref(), Some("fast"));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let script = parse(
            r#"
state_machine:
  initial: idle
  states:
    idle:
      on_event: { go: done }
    done: {}
"#,
        )
        .unwrap();
        let mut ctx = context();
        let token = ctx.cancel_token();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            token.cancel();
        });
        let err = Executor::new(&script).run(&mut ctx).unwrap_err();
        stopper.join().unwrap();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
