//! Error types for nanlink
//!
//! One enum per failing subsystem (radio attach, role start, link
//! negotiation, stream channel) plus the `NanError` type that unifies them.

use crate::channel::ChannelError;
use crate::state::StateTransitionError;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Radio session attach failures. Fatal to the current attempt; never retried
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("Discovery substrate is not available")]
    Unavailable,
    #[error("Missing permission to use the discovery substrate")]
    PermissionDenied,
    #[error("Attach rejected: {reason}")]
    Rejected { reason: String },
    #[error("A radio session is already attached")]
    AlreadyAttached,
}

/// Failures starting the advertise or discover role
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("No radio session attached")]
    NotAttached,
    #[error("Invalid service descriptor: {reason}")]
    InvalidDescriptor { reason: String },
    #[error("Descriptor role does not match the orchestrator role")]
    RoleMismatch,
    #[error("Role session already started")]
    AlreadyStarted,
    #[error("Start rejected: {reason}")]
    Rejected { reason: String },
}

/// Link negotiation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("A link request is already outstanding")]
    AlreadyPending,
    #[error("No peer to request a link to")]
    NoPeer,
    #[error("Link unavailable")]
    Unavailable,
    #[error("Link lost")]
    Lost,
    #[error("Link request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

/// Stream channel failures
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("No stream connection")]
    NotConnected,
    #[error("A stream connection is already open")]
    AlreadyOpen,
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for nanlink
#[derive(Debug, thiserror::Error)]
pub enum NanError {
    #[error("Attach error: {0}")]
    Attach(#[from] AttachError),

    #[error("Start error: {0}")]
    Start(#[from] StartError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// Channel communication error between tasks
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// The substrate refused a request that has no more specific error
    #[error("Substrate error: {reason}")]
    Substrate { reason: String },
}

pub type NanResult<T> = Result<T, NanError>;

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl NanError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        NanError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        NanError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a substrate error with a reason
    pub fn substrate<T: Into<String>>(reason: T) -> Self {
        NanError::Substrate {
            reason: reason.into(),
        }
    }

    /// Whether the orchestrator loop must stop after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, NanError::Channel { .. })
    }
}

impl From<ChannelError> for NanError {
    fn from(err: ChannelError) -> Self {
        NanError::channel_error(err.to_string())
    }
}
