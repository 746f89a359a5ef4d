//! Where registry mutations are written. Both persisters are best-effort:
//! failures are logged and the in-memory registry stays authoritative.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use veritas_core::SessionsState;
use veritas_store::PersistenceMigrator;

/// Receives the full registry state after every mutation.
pub trait StatePersister: Send + Sync {
    fn persist(&self, state: &SessionsState);
}

/// Writes synchronously on the caller's thread.
impl StatePersister for PersistenceMigrator {
    fn persist(&self, state: &SessionsState) {
        self.save(state);
    }
}

#[derive(Clone, Debug, Default)]
struct Snapshot {
    generation: u64,
    encoded: Option<Arc<str>>,
}

/// Serializes on the caller's thread and writes on a tokio task.
///
/// Snapshots travel over a `watch` channel, so a burst of mutations collapses
/// into a write of the newest state; an older state can never overwrite a
/// newer one.
pub struct BackgroundPersister {
    tx: watch::Sender<Snapshot>,
    written: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl BackgroundPersister {
    /// Start the writer task. Must be called from within a tokio runtime.
    pub fn spawn(migrator: PersistenceMigrator) -> Self {
        let (tx, rx) = watch::channel(Snapshot::default());
        let (ack_tx, written) = watch::channel(0);
        let task = tokio::spawn(run_writer(migrator, rx, ack_tx));
        Self { tx, written, task }
    }

    /// Wait until everything handed to [`StatePersister::persist`] so far has
    /// been written (or failed).
    pub async fn flush(&self) {
        let target = self.tx.borrow().generation;
        let mut written = self.written.clone();
        if written.wait_for(|g| *g >= target).await.is_err() {
            warn!(target, "background persister stopped before flush completed");
        }
    }

    /// Write what is pending and stop the writer task.
    pub async fn shutdown(self) {
        self.flush().await;
        drop(self.tx);
        if let Err(err) = self.task.await {
            warn!(error = %err, "background persister task failed");
        }
    }
}

impl StatePersister for BackgroundPersister {
    fn persist(&self, state: &SessionsState) {
        match serde_json::to_string(state) {
            Ok(encoded) => {
                let encoded: Arc<str> = Arc::from(encoded);
                self.tx.send_modify(|snap| {
                    snap.generation += 1;
                    snap.encoded = Some(encoded);
                });
            }
            Err(err) => warn!(error = %err, "failed to serialize sessions"),
        }
    }
}

async fn run_writer(
    migrator: PersistenceMigrator,
    mut rx: watch::Receiver<Snapshot>,
    ack: watch::Sender<u64>,
) {
    while rx.changed().await.is_ok() {
        let Snapshot { generation, encoded } = rx.borrow_and_update().clone();
        if let Some(encoded) = encoded {
            if let Err(err) = migrator.write_encoded(&encoded) {
                warn!(slot = migrator.slot(), error = %err, kind = err.error_kind(), "failed to persist sessions");
            }
        }
        ack.send_replace(generation);
    }
    debug!(slot = migrator.slot(), "background persister stopped");
}
