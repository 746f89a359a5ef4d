use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextState;
use crate::errors::{LogError, PhaseError};
use crate::ids::SessionId;
use crate::log::MessageLog;
use crate::messages::{Message, TailPatch};
use crate::phase::SessionPhase;

pub const PLACEHOLDER_TITLE: &str = "New session";

/// The two independent session collections. Each has its own storage slot
/// and its own event endpoint on the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFamily {
    Ask,
    Research,
}

impl SessionFamily {
    pub fn slot(self) -> &'static str {
        match self {
            Self::Ask => "ask_sessions",
            Self::Research => "research_sessions",
        }
    }

    /// Path segment under the backend base URL.
    pub fn route(self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::Research => "research",
        }
    }
}

impl std::fmt::Display for SessionFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.route())
    }
}

/// One ask/research conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub phase: SessionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_state: Option<ContextState>,
    #[serde(default)]
    pub messages: MessageLog,
}

impl Session {
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| PLACEHOLDER_TITLE.to_string()),
            created_at: now,
            updated_at: now,
            phase: SessionPhase::Initial,
            context_state: None,
            messages: MessageLog::new(),
        }
    }

    /// Bump `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn transition(&mut self, next: SessionPhase) -> Result<(), PhaseError> {
        self.phase = self.phase.transition(next)?;
        self.touch();
        Ok(())
    }

    pub fn append(&mut self, message: Message) {
        self.messages.append(message);
        self.touch();
    }

    pub fn update_last(&mut self, patch: TailPatch) -> Result<(), LogError> {
        self.messages.update_last(patch)?;
        self.touch();
        Ok(())
    }

    pub fn context_mut(&mut self) -> &mut ContextState {
        self.context_state.get_or_insert_with(ContextState::default)
    }
}

/// Derive a display title from a question: first line, whitespace collapsed,
/// cut at `max_chars` on a char boundary with an ellipsis.
pub fn derive_title(question: &str, max_chars: usize) -> String {
    let line = question.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return PLACEHOLDER_TITLE.to_string();
    }
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

/// Registry-level document: the whole collection plus the active pointer.
///
/// `active_session_id` is either `None` or the id of a member.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsState {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub active_session_id: Option<SessionId>,
}

impl SessionsState {
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.iter().any(|s| &s.id == id)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| &s.id == id)
    }

    pub fn active(&self) -> Option<&Session> {
        self.active_session_id.as_ref().and_then(|id| self.get(id))
    }

    /// Re-derive the active pointer: keep it if it names a member, else fall
    /// back to the first session, else `None`. Returns true if it changed.
    pub fn repair_active(&mut self) -> bool {
        let valid = self
            .active_session_id
            .as_ref()
            .is_some_and(|id| self.contains(id));
        if valid {
            return false;
        }
        let derived = self.sessions.first().map(|s| s.id.clone());
        let changed = derived != self.active_session_id;
        self.active_session_id = derived;
        changed
    }

    pub fn is_consistent(&self) -> bool {
        self.active_session_id
            .as_ref()
            .map_or(true, |id| self.contains(id))
    }
}
