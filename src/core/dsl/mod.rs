//! Script DSL: typed model, parser and state-machine executor

pub mod ast;
pub mod executor;
pub mod parser;

pub use ast::{ActionCall, ChannelDecl, ScriptAst, State, StateMachine, TaskList, UiConfig, TERMINAL_STATE};
pub use executor::{Executor, RunSummary};
pub use parser::{parse, parse_task_list};

use crate::core::actions::ActionRegistry;

/// Static problem found by [`lint`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintIssue {
    /// A transition names an undeclared state
    DanglingTarget {
        /// State holding the transition
        from: String,
        /// Missing target
        target: String,
    },
    /// An action name is not registered
    UnknownAction {
        /// State running the action
        state: String,
        /// Action name
        action: String,
    },
}

impl std::fmt::Display for LintIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DanglingTarget { from, target } => write!(f, "state {from}: unknown target state {target}"),
            Self::UnknownAction { state, action } => write!(f, "state {state}: unknown action {action}"),
        }
    }
}

/// Problems a run would only hit when it reaches them
pub fn lint(script: &ScriptAst, actions: &ActionRegistry) -> Vec<LintIssue> {
    let mut issues: Vec<LintIssue> = script
        .dangling_targets()
        .into_iter()
        .map(|(from, target)| LintIssue::DanglingTarget { from, target })
        .collect();
    for state in script.state_machine.states.values() {
        for call in state.actions.iter().filter(|c| !actions.contains(&c.name)) {
            issues.push(LintIssue::UnknownAction {
                state: state.name.clone(),
                action: call.name.clone(),
            });
        }
    }
    issues
}
