//! CVR updaters.
//!
//! An updater borrows a loaded snapshot for the duration of one update,
//! accumulates pending writes against it and persists everything through the
//! store in a single transaction. Three shapes share the same base:
//!
//! * [`CvrUpdater`] records presence only (bumps `last_active`).
//! * [`ConfigUpdater`] edits the client/query configuration.
//! * [`QueryUpdater`] edits the row set under a declared set of executed and
//!   removed queries.
//!
//! Subsequent updates must reload; a snapshot is never reused across
//! updates.

mod config;
mod query;

pub use config::ConfigUpdater;
pub use query::{QueryUpdater, ReceivedRow};

use chrono::NaiveDateTime;
use rowsync_core::{
    cancel::Cancelled,
    models::{
        cvr::{ClientViewRecord, RowId},
        version::{CvrVersion, StateVersion},
    },
    storage::{CvrSnapshot, CvrStore, FlushStats, PendingChanges, StorageError},
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

/// Bound on any single store operation issued by an updater.
const STORE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// Updater methods were invoked out of sequence. Programmer error, fatal
    /// to the update.
    #[error("invalid updater state: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Runs a store future under the updater I/O bound.
pub(crate) async fn with_timeout<T>(
    what: &'static str,
    fut: impl std::future::Future<Output = Result<T, StorageError>>,
) -> Result<T, UpdaterError> {
    match tokio::time::timeout(STORE_TIMEOUT, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(StorageError::Timeout(what.to_string()).into()),
    }
}

/// State shared by all updater shapes: the loaded snapshot, the version the
/// update moves to, and the writes accumulated so far.
pub(crate) struct UpdaterBase {
    pub store: Arc<dyn CvrStore>,
    pub snapshot: CvrSnapshot,
    pub new_version: CvrVersion,
    pub pending: PendingChanges,
}

impl UpdaterBase {
    fn new(store: Arc<dyn CvrStore>, snapshot: CvrSnapshot) -> Self {
        let new_version = snapshot.cvr.version.clone();
        let pending = PendingChanges {
            version: new_version.clone(),
            replica_version: snapshot.cvr.replica_version.clone(),
            ..Default::default()
        };
        UpdaterBase { store, snapshot, new_version, pending }
    }

    /// Advances to the next minor version, exactly once per update.
    pub fn ensure_minor_advance(&mut self) -> CvrVersion {
        if self.new_version == self.snapshot.cvr.version {
            self.new_version = self.snapshot.cvr.version.next_minor();
        }
        self.new_version.clone()
    }

    /// Advances for a query-driven update targeting `state_version`, exactly
    /// once per update: a fresh state version resets the minor counter, a
    /// repeated one bumps it.
    pub fn ensure_state_advance(&mut self, state_version: &StateVersion) -> CvrVersion {
        if self.new_version == self.snapshot.cvr.version {
            self.new_version = if *state_version > self.snapshot.cvr.version.state_version {
                CvrVersion::new(state_version.clone(), 0)
            } else {
                self.snapshot.cvr.version.next_minor()
            };
        }
        self.new_version.clone()
    }

    /// Persists the accumulated changes in one transaction and returns the
    /// updated aggregate. Duplicate pending entries collapse last-wins before
    /// the write so batch upserts never touch one key twice.
    async fn flush(mut self, now: NaiveDateTime) -> Result<(ClientViewRecord, FlushStats), UpdaterError> {
        self.pending.version = self.new_version.clone();
        self.pending = dedup_pending(self.pending);

        let stats = with_timeout("flush", self.store.flush(&self.snapshot, self.pending, now)).await?;
        debug!(
            client_group = %self.snapshot.cvr.id,
            version = %self.new_version,
            ?stats,
            "cvr update flushed"
        );

        let mut cvr = self.snapshot.cvr;
        cvr.version = self.new_version;
        cvr.last_active = now;
        Ok((cvr, stats))
    }
}

fn dedup_pending(pending: PendingChanges) -> PendingChanges {
    let mut clients = BTreeMap::new();
    for client in pending.clients {
        clients.insert(client.id.clone(), client);
    }
    let mut queries = BTreeMap::new();
    for query in pending.queries {
        queries.insert(query.hash.clone(), query);
    }
    let mut desires = BTreeMap::new();
    for desire in pending.desires {
        desires.insert((desire.client_id.clone(), desire.hash.clone()), desire);
    }
    let mut rows = BTreeMap::new();
    for row in pending.rows {
        rows.insert(row.id.clone(), row);
    }
    let removed_rows: Vec<RowId> = pending
        .removed_rows
        .into_iter()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    PendingChanges {
        version: pending.version,
        replica_version: pending.replica_version,
        clients: clients.into_values().collect(),
        queries: queries.into_values().collect(),
        desires: desires.into_values().collect(),
        rows: rows.into_values().collect(),
        removed_rows,
        rows_version: pending.rows_version,
    }
}

/// The no-op updater: records presence without changing the version.
pub struct CvrUpdater {
    base: UpdaterBase,
}

impl CvrUpdater {
    pub fn new(store: Arc<dyn CvrStore>, snapshot: CvrSnapshot) -> Self {
        CvrUpdater { base: UpdaterBase::new(store, snapshot) }
    }

    pub async fn flush(self, now: NaiveDateTime) -> Result<(ClientViewRecord, FlushStats), UpdaterError> {
        self.base.flush(now).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDateTime;
    use rowsync_core::{
        models::version::{CvrVersion, StateVersion},
        storage::{CvrSnapshot, CvrStore},
    };
    use rowsync_storage::memory::MemoryCvrStore;
    use std::sync::Arc;

    pub fn ts(raw: &str) -> NaiveDateTime {
        raw.parse().unwrap()
    }

    pub fn version(seq: u64, minor: u32) -> CvrVersion {
        CvrVersion::new(StateVersion::from_sequence(seq), minor)
    }

    pub async fn fresh_snapshot(store: &Arc<MemoryCvrStore>, group: &str) -> CvrSnapshot {
        store
            .load(&group.to_string(), "task-test", ts("2024-05-13T10:00:00"))
            .await
            .unwrap()
    }

    pub async fn reload(store: &Arc<MemoryCvrStore>, group: &str, at: &str) -> CvrSnapshot {
        store
            .load(&group.to_string(), "task-test", ts(at))
            .await
            .unwrap()
    }
}
