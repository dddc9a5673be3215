//! # ProtoFlow Core Library
//!
//! A scriptable protocol automation engine:
//! - YAML state-machine scripts with typed variables and guard expressions
//! - Channels over serial ports, TCP and an in-process simulator
//! - Protocol drivers for Modbus RTU/ASCII/TCP, XMODEM, YMODEM, SCPI and AT
//! - An action library (send, wait, events, list transforms, charts)
//! - A JSONL experiment recorder for reproducible runs
//!
//! ## Example
//!
//! ```rust,no_run
//! use protoflow_core::core::runtime::{run_script, RunOptions};
//!
//! let script = r#"
//! vars:
//!   count: 0
//! state_machine:
//!   initial: loop
//!   states:
//!     loop:
//!       do:
//!         - set: { count: "$count + 1" }
//!       when: "$count < 3"
//!       goto: loop
//!       else_goto: done
//! "#;
//!
//! let outcome = run_script(script, RunOptions::default())?;
//! assert_eq!(outcome.vars["count"], protoflow_core::Value::Int(3));
//! # Ok::<(), protoflow_core::EngineError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::EngineConfig;
pub use crate::core::actions::ActionRegistry;
pub use crate::core::channel::{Channel, ChannelConfig, ChannelError};
pub use crate::core::dsl::{parse, Executor, RunSummary, ScriptAst};
pub use crate::core::error::{EngineError, ScriptError};
pub use crate::core::protocol::{ProtocolDriver, ProtocolError, ProtocolKind, ProtocolRegistry, RetryPolicy};
pub use crate::core::runtime::{
    run_file, run_script, spawn_script, CancelToken, ContextConfig, Event, ExperimentRecorder, RunOptions,
    RunOutcome, RuntimeContext,
};
pub use crate::core::value::{Args, Value, Variables};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
