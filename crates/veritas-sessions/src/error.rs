use veritas_core::{LogError, PhaseError, SessionId, SessionPhase};

/// A registry operation that was rejected. Rejections never leave partial
/// state behind.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    UnknownSession(SessionId),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("no research plan to confirm (phase {0})")]
    NoPlan(SessionPhase),
}

impl RegistryError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownSession(_) => "unknown_session",
            Self::Phase(_) => "illegal_transition",
            Self::Log(_) => "not_patchable",
            Self::NoPlan(_) => "no_plan",
        }
    }
}
