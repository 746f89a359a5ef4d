//! Durable storage for session collections: named JSON slots in SQLite (or in
//! memory) and the load/save/migrate layer on top of them.

pub mod database;
pub mod error;
pub mod migrate;
pub mod persistence;
pub mod schema;
pub mod slots;

pub use database::Database;
pub use error::StoreError;
pub use migrate::{migrate, migrate_document, MigrationReport};
pub use persistence::PersistenceMigrator;
pub use slots::{MemorySlotStore, SlotRepo, SlotStore};
