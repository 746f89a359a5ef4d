use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use veritas_core::events::LogLevel;
use veritas_core::session::{derive_title, PLACEHOLDER_TITLE};
use veritas_core::{
    ContextState, Message, MessagePayload, Role, Session, SessionFamily, SessionId, SessionPhase,
    SessionsState, StreamEvent, TailPatch,
};
use veritas_store::PersistenceMigrator;

use crate::error::RegistryError;
use crate::persister::StatePersister;
use crate::projection::{project, LogOp, ProjectionConfig};

/// Owns one family's sessions and the active pointer.
///
/// `active_session_id` is `None` or names a member after every operation.
/// Each successful mutation hands the whole state to the persister; rejected
/// operations change nothing and write nothing.
pub struct SessionRegistry {
    family: SessionFamily,
    state: SessionsState,
    persister: Arc<dyn StatePersister>,
    projection: ProjectionConfig,
}

impl SessionRegistry {
    pub fn new(family: SessionFamily, state: SessionsState, persister: Arc<dyn StatePersister>) -> Self {
        let mut state = state;
        if state.repair_active() {
            debug!(%family, "repaired active session on construction");
        }
        Self {
            family,
            state,
            persister,
            projection: ProjectionConfig::default(),
        }
    }

    /// Load the family's collection and write back through the same slot.
    pub fn open(migrator: PersistenceMigrator) -> Self {
        let family = migrator.family();
        let state = migrator.load();
        info!(%family, sessions = state.sessions.len(), "session registry loaded");
        Self::new(family, state, Arc::new(migrator))
    }

    pub fn with_projection(mut self, projection: ProjectionConfig) -> Self {
        self.projection = projection;
        self
    }

    pub fn family(&self) -> SessionFamily {
        self.family
    }

    pub fn state(&self) -> &SessionsState {
        &self.state
    }

    pub fn sessions(&self) -> &[Session] {
        &self.state.sessions
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.state.get(id)
    }

    pub fn active(&self) -> Option<&Session> {
        self.state.active()
    }

    pub fn active_id(&self) -> Option<&SessionId> {
        self.state.active_session_id.as_ref()
    }

    /// New session at the front of the collection, made active.
    #[instrument(skip(self), fields(family = %self.family))]
    pub fn create_session(&mut self, seed: Option<&str>) -> &Session {
        let title = seed.map(|s| derive_title(s, self.projection.title_max_chars));
        let session = Session::new(title);
        info!(session_id = %session.id, "session created");
        self.state.active_session_id = Some(session.id.clone());
        self.state.sessions.insert(0, session);
        self.persist();
        &self.state.sessions[0]
    }

    pub fn set_active(&mut self, id: &SessionId) -> Result<(), RegistryError> {
        if !self.state.contains(id) {
            warn!(session_id = %id, family = %self.family, "cannot activate unknown session");
            return Err(RegistryError::UnknownSession(id.clone()));
        }
        if self.state.active_session_id.as_ref() == Some(id) {
            return Ok(());
        }
        self.state.active_session_id = Some(id.clone());
        self.persist();
        Ok(())
    }

    #[instrument(skip(self), fields(family = %self.family))]
    pub fn delete_session(&mut self, id: &SessionId) -> Result<Session, RegistryError> {
        let Some(index) = self.state.sessions.iter().position(|s| &s.id == id) else {
            warn!(session_id = %id, "cannot delete unknown session");
            return Err(RegistryError::UnknownSession(id.clone()));
        };
        let removed = self.state.sessions.remove(index);
        if self.state.repair_active() {
            debug!(active = ?self.state.active_session_id, "active session re-derived");
        }
        info!(session_id = %id, "session deleted");
        self.persist();
        Ok(removed)
    }

    /// Delete every session of the family.
    pub fn reset(&mut self) {
        let count = self.state.sessions.len();
        self.state = SessionsState::default();
        info!(family = %self.family, count, "sessions reset");
        self.persist();
    }

    pub fn rename(&mut self, id: &SessionId, title: &str) -> Result<(), RegistryError> {
        let session = self.session_mut(id)?;
        session.title = if title.trim().is_empty() {
            PLACEHOLDER_TITLE.to_string()
        } else {
            title.trim().to_string()
        };
        session.touch();
        self.persist();
        Ok(())
    }

    pub fn append_message(&mut self, id: &SessionId, message: Message) -> Result<(), RegistryError> {
        self.session_mut(id)?.append(message);
        self.persist();
        Ok(())
    }

    /// Fill in the streaming tail of a session's log.
    pub fn update_last(&mut self, id: &SessionId, patch: TailPatch) -> Result<(), RegistryError> {
        let session = self.session_mut(id)?;
        if let Err(err) = session.update_last(patch) {
            warn!(session_id = %id, error = %err, "tail patch rejected");
            return Err(err.into());
        }
        self.persist();
        Ok(())
    }

    /// Move a session along the phase table. Illegal moves are rejected and
    /// leave the phase untouched.
    pub fn transition(&mut self, id: &SessionId, next: SessionPhase) -> Result<(), RegistryError> {
        let session = self.session_mut(id)?;
        let from = session.phase;
        if let Err(err) = session.transition(next) {
            warn!(session_id = %id, error = %err, "phase transition rejected");
            return Err(err.into());
        }
        info!(session_id = %id, %from, to = %next, "phase changed");
        self.persist();
        Ok(())
    }

    /// The user asks a question: log it, seed the context, title the session
    /// and start clarifying.
    #[instrument(skip(self, question), fields(family = %self.family))]
    pub fn submit_question(&mut self, id: &SessionId, question: &str) -> Result<(), RegistryError> {
        let max_chars = self.projection.title_max_chars;
        let session = self.session_mut(id)?;

        session.append(Message::user_text(question));
        let title = derive_title(question, max_chars);
        if session.title == PLACEHOLDER_TITLE {
            session.title = title.clone();
        }
        let ctx = session.context_mut();
        if ctx.user_query.is_empty() {
            ctx.user_query = question.to_string();
        }
        if ctx.session_title.is_empty() {
            ctx.session_title = title;
        }
        if session.phase == SessionPhase::Initial {
            session.phase = SessionPhase::Clarifying;
        }
        self.persist();
        Ok(())
    }

    /// Clarification questions from the pipeline.
    pub fn record_clarification(
        &mut self,
        id: &SessionId,
        questions: Vec<String>,
    ) -> Result<(), RegistryError> {
        let session = self.session_mut(id)?;
        if session.phase == SessionPhase::Initial {
            session.transition(SessionPhase::Clarifying)?;
        }
        let text = questions
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{}. {q}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        session.context_mut().clarification_questions = questions;
        session.append(Message::assistant_text(text));
        self.persist();
        Ok(())
    }

    pub fn answer_clarification(
        &mut self,
        id: &SessionId,
        answers: Vec<String>,
    ) -> Result<(), RegistryError> {
        let session = self.session_mut(id)?;
        let text = answers.join("\n");
        let ctx = session.context_mut();
        ctx.clarification_answers = answers;
        ctx.current_step += 1;
        session.append(Message::user_text(text));
        self.persist();
        Ok(())
    }

    /// Install a research plan: moves clarifying to planning, or revises the
    /// plan in place while planning.
    pub fn set_plan(&mut self, id: &SessionId, points: Vec<String>) -> Result<(), RegistryError> {
        let session = self.session_mut(id)?;
        let phase = session.phase;
        if !phase.accepts_plan_revision() {
            if let Err(err) = phase.transition(SessionPhase::Planning) {
                warn!(session_id = %id, error = %err, "plan rejected");
                return Err(err.into());
            }
            session.phase = SessionPhase::Planning;
        }
        let ctx = session.context_mut();
        ctx.set_plan(points);
        let message = Message::new(
            Role::Assistant,
            ctx.format_plan(),
            MessagePayload::Plan {
                points: ctx.research_plan.clone(),
                version: ctx.plan_version,
            },
        );
        session.append(message);
        self.persist();
        Ok(())
    }

    /// The user accepts the plan; research starts.
    pub fn confirm_plan(&mut self, id: &SessionId) -> Result<(), RegistryError> {
        let session = self.session_mut(id)?;
        let has_plan = session.context_state.as_ref().is_some_and(ContextState::has_plan);
        if !has_plan {
            warn!(session_id = %id, phase = %session.phase, "no plan to confirm");
            return Err(RegistryError::NoPlan(session.phase));
        }
        if let Err(err) = session.transition(SessionPhase::Researching) {
            warn!(session_id = %id, error = %err, "plan confirmation rejected");
            return Err(err.into());
        }
        session.context_mut().current_step += 1;
        info!(session_id = %id, "plan confirmed, research started");
        self.persist();
        Ok(())
    }

    /// Fold one stream event into a session. Unknown sessions are the only
    /// rejection; an event whose projected phase change is illegal still
    /// updates the log.
    pub fn apply_event(&mut self, id: &SessionId, event: &StreamEvent) -> Result<(), RegistryError> {
        mirror_log(id, event);
        let projection = {
            let session = self
                .state
                .get(id)
                .ok_or_else(|| RegistryError::UnknownSession(id.clone()))?;
            project(event, session, &self.projection)
        };
        if projection.is_empty() {
            return Ok(());
        }

        let session = self.session_mut(id)?;
        match projection.log {
            Some(LogOp::Append(message)) => session.append(message),
            Some(LogOp::Patch(patch)) => {
                if let Err(err) = session.update_last(patch) {
                    warn!(session_id = %id, kind = event.kind(), error = %err, "event patch rejected");
                }
            }
            None => {}
        }
        if let Some(next) = projection.phase {
            match session.transition(next) {
                Ok(()) => info!(session_id = %id, to = %next, "phase changed by event"),
                Err(err) => warn!(session_id = %id, kind = event.kind(), error = %err, "event phase change ignored"),
            }
        }
        self.persist();
        Ok(())
    }

    fn session_mut(&mut self, id: &SessionId) -> Result<&mut Session, RegistryError> {
        let family = self.family;
        self.state.get_mut(id).ok_or_else(|| {
            warn!(session_id = %id, %family, "unknown session");
            RegistryError::UnknownSession(id.clone())
        })
    }

    fn persist(&self) {
        debug_assert!(self.state.is_consistent());
        self.persister.persist(&self.state);
    }
}

/// Server log frames go to our log at the matching level.
fn mirror_log(id: &SessionId, event: &StreamEvent) {
    let StreamEvent::Log { level, message, full } = event else {
        return;
    };
    let full = full.as_deref().unwrap_or("");
    match level {
        LogLevel::Debug => debug!(session_id = %id, full, "backend: {message}"),
        LogLevel::Info => info!(session_id = %id, full, "backend: {message}"),
        LogLevel::Warning => warn!(session_id = %id, full, "backend: {message}"),
        LogLevel::Error => error!(session_id = %id, full, "backend: {message}"),
    }
}
