//! Typed script model produced by the parser

use crate::core::channel::ChannelConfig;
use crate::core::value::{Args, Value, Variables};
use std::collections::BTreeMap;
use std::time::Duration;

/// State name that ends a run after its actions
pub const TERMINAL_STATE: &str = "done";

/// A parsed script
#[derive(Debug, Clone)]
pub struct ScriptAst {
    /// Document version (defaults to 1)
    pub version: i64,
    /// Initial variables
    pub vars: Variables,
    /// Channels in declaration order; the first one is the default
    pub channels: Vec<ChannelDecl>,
    /// The state machine
    pub state_machine: StateMachine,
    /// Presentation hints for hosts with a UI
    pub ui: UiConfig,
}

impl ScriptAst {
    /// Name of the default channel
    pub fn default_channel(&self) -> Option<&str> {
        self.channels.first().map(|c| c.name.as_str())
    }

    /// Transition targets that name undeclared states, as `(from, target)`
    pub fn dangling_targets(&self) -> Vec<(String, String)> {
        let sm = &self.state_machine;
        let mut dangling = Vec::new();
        for state in sm.states.values() {
            for target in state.targets() {
                if target != TERMINAL_STATE && !sm.states.contains_key(target) {
                    dangling.push((state.name.clone(), target.to_string()));
                }
            }
        }
        dangling
    }
}

/// A task-list document: actions run once, in order, without a state machine
#[derive(Debug, Clone, Default)]
pub struct TaskList {
    /// Initial variables
    pub vars: Variables,
    /// Channels in declaration order
    pub channels: Vec<ChannelDecl>,
    /// Tasks
    pub tasks: Vec<ActionCall>,
}

/// Named channel declaration
#[derive(Debug, Clone)]
pub struct ChannelDecl {
    /// Channel name used by actions
    pub name: String,
    /// Transport parameters
    pub config: ChannelConfig,
}

/// State machine definition
#[derive(Debug, Clone)]
pub struct StateMachine {
    /// Entry state
    pub initial: String,
    /// States by name
    pub states: BTreeMap<String, State>,
}

/// One state
#[derive(Debug, Clone, Default)]
pub struct State {
    /// State name
    pub name: String,
    /// Actions run on entry, in order
    pub actions: Vec<ActionCall>,
    /// Event name to target state
    pub on_event: BTreeMap<String, String>,
    /// Maximum time to wait for an event
    pub timeout: Option<Duration>,
    /// Target when the timeout elapses
    pub on_timeout: Option<String>,
    /// Guard for `goto`
    pub when: Option<Value>,
    /// Next state
    pub goto: Option<String>,
    /// Next state when the guard is false
    pub else_goto: Option<String>,
}

impl State {
    /// No outgoing transition is possible after the actions
    pub fn is_terminal(&self) -> bool {
        self.name == TERMINAL_STATE
            || (self.goto.is_none() && self.on_event.is_empty() && self.timeout.is_none())
    }

    /// Whether this state blocks waiting for events or a timeout
    pub fn waits(&self) -> bool {
        !self.on_event.is_empty() || self.timeout.is_some()
    }

    /// All transition targets named by this state
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.goto
            .iter()
            .chain(self.else_goto.iter())
            .chain(self.on_timeout.iter())
            .chain(self.on_event.values())
            .map(String::as_str)
    }
}

/// A normalized action invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    /// Registered action name
    pub name: String,
    /// Raw arguments, evaluated by the action itself
    pub args: Args,
}

impl ActionCall {
    /// Create an action call
    pub fn new(name: impl Into<String>, args: Args) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// UI section
#[derive(Debug, Clone, Default)]
pub struct UiConfig {
    /// Chart definitions
    pub charts: Vec<ChartSpec>,
    /// Control panels
    pub controls: Vec<ControlSpec>,
    /// Optional layout tree
    pub layout: Option<LayoutNode>,
}

/// Chart definition
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    /// Chart id (defaults to `chart_<index>`)
    pub id: String,
    /// Display title (defaults to the id)
    pub title: String,
    /// Series key that `chart_add` points bind to
    pub bind: String,
    /// Lowercased chart type: `line`, `scatter`, `scatter3d`, ...
    pub chart_type: String,
    /// X axis key for 3D charts
    pub bind_x: Option<String>,
    /// Y axis key for 3D charts
    pub bind_y: Option<String>,
    /// Z axis key for 3D charts
    pub bind_z: Option<String>,
    /// Shared panel group
    pub group: Option<String>,
    /// Render in its own panel
    pub separate: bool,
    /// Points retained per series
    pub max_points: usize,
}

/// Control panel
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSpec {
    /// Panel id
    pub id: String,
    /// Panel title
    pub title: String,
    /// Render in its own panel
    pub separate: bool,
    /// Input fields
    pub inputs: Vec<ControlInput>,
    /// Buttons that emit events
    pub actions: Vec<ControlAction>,
}

/// Control input field
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInput {
    /// Variable name
    pub name: String,
    /// Label
    pub label: String,
    /// Lowercased input type (`float`, `int`, `text`, `select`, ...)
    pub input_type: String,
    /// Minimum
    pub min: Option<f64>,
    /// Maximum
    pub max: Option<f64>,
    /// Step
    pub step: Option<f64>,
    /// Default value
    pub default: Value,
    /// Options for `select`
    pub options: Vec<String>,
    /// Placeholder text
    pub placeholder: Option<String>,
}

/// Control button
#[derive(Debug, Clone, PartialEq)]
pub struct ControlAction {
    /// Button name
    pub name: String,
    /// Event emitted when pressed
    pub emit: String,
    /// Label
    pub label: String,
}

/// Layout tree node
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutNode {
    /// Split into children
    Split {
        /// Split direction
        orientation: Orientation,
        /// Child nodes
        children: Vec<LayoutNode>,
    },
    /// Leaf listing chart and control ids
    Leaf {
        /// Chart ids
        charts: Vec<String>,
        /// Control ids
        controls: Vec<String>,
    },
}

/// Split direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Side by side
    Horizontal,
    /// Stacked
    Vertical,
}
