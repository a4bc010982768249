//! Storage boundary for client view records.
//!
//! Implementations live elsewhere (postgres-backed and in-memory); this
//! module defines the gateway trait they share, the snapshot/pending-change
//! shapes moving across it, and the error taxonomy consumed by the updaters.
//!
//! Two concurrency defenses are part of the contract rather than the
//! implementation:
//!
//! * **Ownership fencing** - `load` claims the `(owner, granted_at)` lease for
//!   the group; any flush under a stale lease fails with
//!   [`StorageError::Ownership`], which is fatal to the losing syncer process.
//! * **Optimistic concurrency** - `flush` verifies that the stored version
//!   still equals the loaded one and fails with
//!   [`StorageError::ConcurrentModification`] otherwise; callers discard
//!   in-progress work and reload.

use crate::models::{
    cvr::{ClientRecord, ClientViewRecord, QueryRecord, RowId, RowRecord},
    patch::PatchToVersion,
    version::CvrVersion,
    ClientGroupId, ClientId, QueryHash,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum StorageError {
    /// Another process holds a newer lease on the CVR. Fatal to this syncer.
    #[error("cvr ownership lost to {owner} (granted at {granted_at})")]
    Ownership { owner: String, granted_at: NaiveDateTime },
    /// The loaded snapshot is stale; reload and retry.
    #[error("concurrent cvr modification: expected version {expected:?}, found {actual:?}")]
    ConcurrentModification { expected: String, actual: String },
    /// The CVR was hydrated against a different replica; the caller must
    /// trigger a client-state reset.
    #[error("replica version mismatch: cvr has {stored:?}, replica is {supplied}")]
    ReplicaVersionMismatch { stored: Option<String>, supplied: String },
    #[error("could not find {0} with id `{1}`")]
    NotFound(String, String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("unexpected storage error: {0}")]
    Unexpected(String),
}

/// A loaded CVR together with the lease epoch it was loaded under.
///
/// The epoch travels with the snapshot so that `flush` can verify the lease
/// is still ours without consulting process-global state.
#[derive(Clone, Debug, PartialEq)]
pub struct CvrSnapshot {
    pub cvr: ClientViewRecord,
    pub owner: String,
    pub granted_at: NaiveDateTime,
}

/// Desire tombstones and upserts travel separately from the client and query
/// records they connect, mirroring the persisted table layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DesireRecord {
    pub client_id: ClientId,
    pub hash: QueryHash,
    pub patch_version: CvrVersion,
    pub deleted: bool,
}

/// Accumulated writes of one CVR update, applied atomically by `flush`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PendingChanges {
    /// Version the instance row moves to.
    pub version: CvrVersion,
    pub replica_version: Option<String>,
    pub clients: Vec<ClientRecord>,
    pub queries: Vec<QueryRecord>,
    pub desires: Vec<DesireRecord>,
    pub rows: Vec<RowRecord>,
    /// Row ids to delete outright. Only used when the upstream signalled a
    /// row-key rename: the record continues under its new key, so no
    /// tombstone remains under the old one.
    pub removed_rows: Vec<RowId>,
    /// New value of the redundant rows-version index, when rows changed.
    pub rows_version: Option<CvrVersion>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
            && self.queries.is_empty()
            && self.desires.is_empty()
            && self.rows.is_empty()
            && self.removed_rows.is_empty()
            && self.rows_version.is_none()
    }
}

/// Row counts of a successful flush, for logging and metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FlushStats {
    pub clients: usize,
    pub queries: usize,
    pub desires: usize,
    pub rows: usize,
}

/// Batched stream of row records; intra-batch order is arbitrary.
pub type RowRecordStream = BoxStream<'static, Result<Vec<RowRecord>, StorageError>>;
/// Ordered stream of configuration patches, ascending by patch version.
pub type ConfigPatchStream = BoxStream<'static, Result<PatchToVersion, StorageError>>;

/// Persistence gateway for client view records.
#[async_trait]
pub trait CvrStore: Send + Sync {
    /// Atomically reads the CVR aggregate for `client_group` and claims the
    /// ownership lease at `(owner, last_connect)`.
    ///
    /// Succeeds only when the stored `granted_at` precedes `last_connect`;
    /// a newer holder surfaces as [`StorageError::Ownership`]. A group never
    /// seen before is created at the minimum version.
    async fn load(
        &self,
        client_group: &ClientGroupId,
        owner: &str,
        last_connect: NaiveDateTime,
    ) -> Result<CvrSnapshot, StorageError>;

    /// Applies `pending` in a single transaction, verifying version and lease
    /// first. Nothing is persisted on any error.
    async fn flush(
        &self,
        snapshot: &CvrSnapshot,
        pending: PendingChanges,
        now: NaiveDateTime,
    ) -> Result<FlushStats, StorageError>;

    /// Removes every trace of the group in one transaction: instance,
    /// clients, queries, desires, rows and the rows-version index. Backs the
    /// delete-all operation; refusing subsequent connects is the service
    /// layer's job.
    async fn purge(&self, client_group: &ClientGroupId) -> Result<(), StorageError>;

    /// Existing row records for the given ids; missing ids are simply absent
    /// from the result.
    async fn load_rows(
        &self,
        client_group: &ClientGroupId,
        ids: &[RowId],
    ) -> Result<Vec<RowRecord>, StorageError>;

    /// Full scan of the group's row records, tombstones included.
    async fn row_records(
        &self,
        client_group: &ClientGroupId,
    ) -> Result<RowRecordStream, StorageError>;

    /// Configuration changes with `patch_version ∈ (after, current]` in
    /// ascending patch-version order.
    async fn catchup_config_patches(
        &self,
        client_group: &ClientGroupId,
        after: &CvrVersion,
        current: &CvrVersion,
    ) -> Result<ConfigPatchStream, StorageError>;

    /// Row records with `patch_version ∈ (after, current]`, excluding live
    /// rows whose only references are in `exclude_queries` (those reach the
    /// client through the hydration path instead).
    async fn catchup_row_patches(
        &self,
        client_group: &ClientGroupId,
        after: &CvrVersion,
        current: &CvrVersion,
        exclude_queries: &[QueryHash],
    ) -> Result<RowRecordStream, StorageError>;
}
