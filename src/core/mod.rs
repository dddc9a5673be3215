//! Core module containing the automation engine
//!
//! This module provides:
//! - Dynamic values and the `$`-expression language
//! - Script parsing and the state-machine executor
//! - Channels (serial, TCP, simulator) and protocol drivers
//! - The action registry and built-in actions
//! - Runtime context, event queue and experiment recorder

pub mod actions;
pub mod channel;
pub mod dsl;
pub mod error;
pub mod expression;
pub mod protocol;
pub mod runtime;
pub mod value;
