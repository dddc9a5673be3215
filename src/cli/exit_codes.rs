//! CLI Exit Codes
//!
//! Process exit codes for batch runs and automation.

use crate::config::ConfigError;
use crate::core::error::EngineError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// Unhandled runtime error
    pub const ERROR: u8 = 1;

    /// Missing or invalid script, task list or settings
    pub const CONFIG_ERROR: u8 = 2;

    /// Interrupted with Ctrl-C
    pub const CANCELLED: u8 = 130;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for stdout
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Invalid configuration
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<EngineError> for CliResult {
    fn from(err: EngineError) -> Self {
        let code = match &err {
            EngineError::Cancelled => ExitCodes::CANCELLED,
            EngineError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => ExitCodes::CONFIG_ERROR,
            e if e.is_configuration() => ExitCodes::CONFIG_ERROR,
            _ => ExitCodes::ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::config_error(err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        ExitCodes::SUCCESS => "Success",
        ExitCodes::ERROR => "Runtime error",
        ExitCodes::CONFIG_ERROR => "Missing or invalid configuration",
        ExitCodes::CANCELLED => "Interrupted",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [
        ExitCodes::SUCCESS,
        ExitCodes::ERROR,
        ExitCodes::CONFIG_ERROR,
        ExitCodes::CANCELLED,
    ] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
