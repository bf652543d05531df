//! Session error taxonomy.
//!
//! Every variant ends the session. Unmatched write acknowledgements are not
//! errors; they are counted in [`crate::state::SessionStats`].

use std::time::Duration;

use lqbench_core::InboundMessage;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::state::Stage;

/// Why a session ended without passing.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An inbound message failed the current stage's exit check.
    #[error("protocol violation while {stage}: {reason}")]
    ProtocolViolation {
        /// Stage that rejected the message.
        stage: Stage,
        /// What was wrong.
        reason: String,
        /// The offending message, when there was one.
        message: Option<Value>,
    },

    /// The session-wide deadline fired before cleanup.
    #[error("session deadline of {after:?} exceeded while {stage}")]
    DeadlineExceeded {
        /// Stage the session was in when the deadline fired.
        stage: Stage,
        /// Configured session budget.
        after: Duration,
    },

    /// Transport-level failure.
    #[error("connection error: {0}")]
    Connection(#[from] tungstenite::Error),

    /// The backend closed the connection before teardown.
    #[error("connection closed by peer while {stage}")]
    ConnectionClosed {
        /// Stage at the time of the close.
        stage: Stage,
    },

    /// A teardown invariant did not hold.
    #[error("teardown invariant violated: {0}")]
    InvariantViolation(String),

    /// A stage change that is not a forward step.
    #[error("illegal stage transition {from} -> {to}")]
    IllegalTransition {
        /// Current stage.
        from: Stage,
        /// Requested stage.
        to: Stage,
    },

    /// A second subscription handle was offered for the session.
    #[error("subscription handle already set")]
    DuplicateSubscription,
}

impl SessionError {
    /// Protocol violation attributed to a specific message.
    pub fn violation(stage: Stage, reason: impl Into<String>, message: &InboundMessage) -> Self {
        Self::ProtocolViolation {
            stage,
            reason: reason.into(),
            message: Some(message.value().clone()),
        }
    }

    /// Protocol violation with no message attached.
    pub fn internal_violation(stage: Stage, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            stage,
            reason: reason.into(),
            message: None,
        }
    }

    /// Machine-readable code for reports and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            Self::Connection(_) | Self::ConnectionClosed { .. } => "CONNECTION_ERROR",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::DuplicateSubscription => "DUPLICATE_SUBSCRIPTION",
        }
    }
}
