//! Engine error taxonomy
//!
//! Each layer owns its error enum; [`EngineError`] aggregates them for the
//! executor, actions and the runner.

use crate::core::channel::ChannelError;
use crate::core::expression::ExpressionError;
use crate::core::protocol::ProtocolError;
use crate::core::runtime::recorder::RecorderError;
use thiserror::Error;

/// Malformed script document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// Source is not valid YAML
    #[error("invalid YAML: {0}")]
    Yaml(String),

    /// Structural problem at a document location
    #[error("{path}: {message}")]
    Invalid {
        /// Dotted location inside the document
        path: String,
        /// What is wrong
        message: String,
    },

    /// `state_machine.initial` missing or not a declared state
    #[error("state_machine.initial is undefined or not declared in states")]
    InvalidInitial,
}

impl ScriptError {
    /// Structural error at `path`
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while running a script
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed script
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Guard or mapping expression failed
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Action name not registered
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Transition target not declared
    #[error("unknown state: {0}")]
    UnknownState(String),

    /// Protocol driver failure after retries
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Channel failure outside a protocol exchange
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// No channel with that name is open
    #[error("no such channel: {0}")]
    NoChannel(String),

    /// Recorder filesystem failure
    #[error(transparent)]
    Recorder(#[from] RecorderError),

    /// Action called with unusable arguments
    #[error("{action}: {message}")]
    InvalidArgument {
        /// Action name
        action: String,
        /// What is wrong
        message: String,
    },

    /// Run stopped by a cancellation request
    #[error("run cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Invalid argument for `action`
    pub fn invalid_argument(action: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            action: action.to_string(),
            message: message.into(),
        }
    }

    /// Short error class name written to recorder error records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Script(_) => "ScriptError",
            Self::Expression(_) => "ExpressionError",
            Self::UnknownAction(_) => "UnknownActionError",
            Self::UnknownState(_) => "UnknownStateError",
            Self::Protocol(e) => e.kind(),
            Self::Channel(ChannelError::Timeout(_)) => "ChannelTimeoutError",
            Self::Channel(_) | Self::NoChannel(_) => "ChannelError",
            Self::Recorder(_) => "RecorderError",
            Self::InvalidArgument { .. } => "InvalidArgumentError",
            Self::Cancelled => "Cancelled",
            Self::Io(_) => "IoError",
        }
    }

    /// Configuration errors are detected before or independently of hardware I/O
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Script(_) | Self::UnknownAction(_) | Self::UnknownState(_) | Self::NoChannel(_)
        )
    }
}
