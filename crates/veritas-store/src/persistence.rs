use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use veritas_core::{SessionFamily, SessionsState};

use crate::error::StoreError;
use crate::migrate::migrate_document;
use crate::slots::SlotStore;

/// Load/save of one session family's collection, backed by a single slot.
///
/// Neither direction fails from the caller's point of view: unreadable data
/// loads as an empty collection and failed writes are logged and dropped.
#[derive(Clone)]
pub struct PersistenceMigrator {
    store: Arc<dyn SlotStore>,
    family: SessionFamily,
}

impl PersistenceMigrator {
    pub fn new(store: Arc<dyn SlotStore>, family: SessionFamily) -> Self {
        Self { store, family }
    }

    pub fn family(&self) -> SessionFamily {
        self.family
    }

    pub fn slot(&self) -> &'static str {
        self.family.slot()
    }

    #[instrument(skip(self), fields(slot = self.slot()))]
    pub fn load(&self) -> SessionsState {
        let raw = match self.store.read(self.slot()) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("slot empty");
                return SessionsState::default();
            }
            Err(err) => {
                warn!(error = %err, kind = err.error_kind(), "failed to read session slot");
                return SessionsState::default();
            }
        };

        let (state, report) = migrate_document(&raw);
        if !report.is_clean() {
            info!(
                sessions = report.sessions,
                dropped = report.sessions_dropped,
                phases_inferred = report.phases_inferred,
                messages_repaired = report.messages_repaired,
                active_repaired = report.active_repaired,
                "migrated persisted sessions"
            );
        }
        state
    }

    /// Serialize and write the whole collection; failures are logged.
    pub fn save(&self, state: &SessionsState) {
        if let Err(err) = self.try_save(state) {
            warn!(slot = self.slot(), error = %err, kind = err.error_kind(), "failed to persist sessions");
        }
    }

    pub fn try_save(&self, state: &SessionsState) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(state)?;
        self.write_encoded(&encoded)
    }

    /// Write an already serialized document.
    pub fn write_encoded(&self, encoded: &str) -> Result<(), StoreError> {
        self.store.write(self.slot(), encoded)?;
        debug!(slot = self.slot(), bytes = encoded.len(), "sessions persisted");
        Ok(())
    }

    /// Remove the slot entirely.
    pub fn clear(&self) {
        if let Err(err) = self.store.remove(self.slot()) {
            warn!(slot = self.slot(), error = %err, "failed to clear session slot");
        }
    }
}
