use std::time::Duration;

use crate::phase::SessionPhase;

/// Transport faults on a live event subscription.
///
/// None of these cross the stream client's public surface; they are turned
/// into a synthetic `error` event for the handler and followed by teardown.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("stream closed without a terminal event")]
    ClosedEarly,
    #[error("no data for {0:?}")]
    IdleTimeout(Duration),
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl StreamError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Status { .. } => "http_status",
            Self::Interrupted(_) => "stream_interrupted",
            Self::ClosedEarly => "closed_early",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::InvalidUrl(_) => "invalid_url",
        }
    }
}

/// A phase change that is not in the transition table.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("illegal phase transition {from} -> {to}")]
pub struct PhaseError {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

/// Rejected tail patch on a message log.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("message log is empty")]
    Empty,
    #[error("tail message of type {kind} does not accept {patch}")]
    NotPatchable {
        kind: &'static str,
        patch: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_strings() {
        assert_eq!(StreamError::ClosedEarly.error_kind(), "closed_early");
        assert_eq!(
            StreamError::IdleTimeout(Duration::from_secs(90)).error_kind(),
            "idle_timeout"
        );
        assert_eq!(
            StreamError::Status { status: 404, body: String::new() }.error_kind(),
            "http_status"
        );
    }

    #[test]
    fn phase_error_display() {
        let err = PhaseError {
            from: SessionPhase::Done,
            to: SessionPhase::Planning,
        };
        assert_eq!(err.to_string(), "illegal phase transition done -> planning");
    }
}
