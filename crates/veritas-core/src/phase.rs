use serde::{Deserialize, Serialize};

use crate::context::ContextState;
use crate::errors::PhaseError;

/// Lifecycle of one session. Gates which UI affordances are valid.
///
/// ```text
/// initial -> clarifying -> planning -> researching -> done
/// ```
///
/// `planning` may be re-entered in place by a plan revision; `done` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Initial,
    Clarifying,
    Planning,
    Researching,
    Done,
}

impl SessionPhase {
    pub const ALL: [SessionPhase; 5] = [
        Self::Initial,
        Self::Clarifying,
        Self::Planning,
        Self::Researching,
        Self::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Clarifying => "clarifying",
            Self::Planning => "planning",
            Self::Researching => "researching",
            Self::Done => "done",
        }
    }

    /// The single legal successor, if any.
    pub fn successor(self) -> Option<SessionPhase> {
        match self {
            Self::Initial => Some(Self::Clarifying),
            Self::Clarifying => Some(Self::Planning),
            Self::Planning => Some(Self::Researching),
            Self::Researching => Some(Self::Done),
            Self::Done => None,
        }
    }

    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        self.successor() == Some(next)
    }

    /// Validate `self -> next` against the transition table.
    pub fn transition(self, next: SessionPhase) -> Result<SessionPhase, PhaseError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PhaseError { from: self, to: next })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }

    /// Plans may only be replaced while the user is still deciding.
    pub fn accepts_plan_revision(self) -> bool {
        self == Self::Planning
    }

    /// Best-effort reconstruction for documents written before phases existed.
    ///
    /// A non-empty plan means planning; otherwise any message means clarifying;
    /// otherwise initial. A session that was reset mid-flow can be misread, and
    /// the original phase is not recoverable from the legacy data.
    pub fn infer(context: Option<&ContextState>, message_count: usize) -> SessionPhase {
        if context.is_some_and(|c| !c.research_plan.is_empty()) {
            Self::Planning
        } else if message_count > 0 {
            Self::Clarifying
        } else {
            Self::Initial
        }
    }

    pub fn parse(s: &str) -> Option<SessionPhase> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
