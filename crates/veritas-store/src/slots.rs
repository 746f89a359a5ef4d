//! Named key/value slots. Each slot holds one whole JSON document and every
//! write replaces it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// Durable storage for whole-document slots.
pub trait SlotStore: Send + Sync {
    fn read(&self, slot: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, slot: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, slot: &str) -> Result<(), StoreError>;
}

/// SQLite-backed slots.
#[derive(Clone)]
pub struct SlotRepo {
    db: Database,
}

impl SlotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Names of all populated slots.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM slots ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

impl SlotStore for SlotRepo {
    #[instrument(skip(self))]
    fn read(&self, slot: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM slots WHERE name = ?1", [slot], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }

    #[instrument(skip(self, value), fields(bytes = value.len()))]
    fn write(&self, slot: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO slots (name, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![slot, value, now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn remove(&self, slot: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM slots WHERE name = ?1", [slot])?;
            Ok(())
        })
    }
}

/// In-process slots, with switchable write failure for exercising the
/// storage-fault path.
#[derive(Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a slot with raw text, bypassing the failure switch.
    pub fn with_slot(self, slot: &str, value: impl Into<String>) -> Self {
        self.slots.lock().insert(slot.to_string(), value.into());
        self
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn raw(&self, slot: &str) -> Option<String> {
        self.slots.lock().get(slot).cloned()
    }
}

impl SlotStore for MemorySlotStore {
    fn read(&self, slot: &str) -> Result<Option<String>, StoreError> {
        Ok(self.slots.lock().get(slot).cloned())
    }

    fn write(&self, slot: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("quota exceeded".into()));
        }
        self.slots.lock().insert(slot.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, slot: &str) -> Result<(), StoreError> {
        self.slots.lock().remove(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_write_replaces_slot() {
        let repo = SlotRepo::new(Database::in_memory().unwrap());
        assert_eq!(repo.read("ask_sessions").unwrap(), None);
        repo.write("ask_sessions", "{\"a\":1}").unwrap();
        repo.write("ask_sessions", "{\"a\":2}").unwrap();
        assert_eq!(repo.read("ask_sessions").unwrap().as_deref(), Some("{\"a\":2}"));
        assert_eq!(repo.list().unwrap(), vec!["ask_sessions".to_string()]);
    }

    #[test]
    fn sqlite_slots_are_independent() {
        let repo = SlotRepo::new(Database::in_memory().unwrap());
        repo.write("ask_sessions", "ask").unwrap();
        repo.write("research_sessions", "research").unwrap();
        repo.remove("ask_sessions").unwrap();
        assert_eq!(repo.read("ask_sessions").unwrap(), None);
        assert_eq!(repo.read("research_sessions").unwrap().as_deref(), Some("research"));
    }

    #[test]
    fn sqlite_slot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        SlotRepo::new(Database::open(&path).unwrap())
            .write("research_sessions", "persisted")
            .unwrap();
        let repo = SlotRepo::new(Database::open(&path).unwrap());
        assert_eq!(repo.read("research_sessions").unwrap().as_deref(), Some("persisted"));
    }

    #[test]
    fn memory_store_failure_switch() {
        let store = MemorySlotStore::new().with_slot("s", "seed");
        store.fail_writes(true);
        let err = store.write("s", "new").unwrap_err();
        assert_eq!(err.error_kind(), "unavailable");
        assert_eq!(store.raw("s").as_deref(), Some("seed"));
        assert_eq!(store.write_count(), 0);

        store.fail_writes(false);
        store.write("s", "new").unwrap();
        assert_eq!(store.raw("s").as_deref(), Some("new"));
        assert_eq!(store.write_count(), 1);
    }
}
