use super::{with_timeout, UpdaterBase, UpdaterError};
use chrono::NaiveDateTime;
use futures::StreamExt;
use metrics::counter;
use rowsync_core::{
    cancel::CancellationFlag,
    ident::h128_hex,
    models::{
        cvr::{merge_ref_counts, ClientViewRecord, RefCounts, RowId, RowRecord},
        patch::{ConfigPatch, PatchToVersion, RowPatch},
        version::{CvrVersion, StateVersion},
        QueryHash, TransformationHash,
    },
    storage::{CvrSnapshot, CvrStore, DesireRecord, FlushStats, StorageError},
};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, instrument};

/// One row delta produced by the IVM pipeline for this client group.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedRow {
    pub id: RowId,
    pub row_version: String,
    pub contents: Value,
    /// Per-query refcount deltas. Zero means "still referenced, count
    /// unchanged"; positive adds references, negative removes them.
    pub ref_count_deltas: RefCounts,
    /// Set when the upstream signals that this row continues a prior key
    /// under a new one while retaining identity.
    pub replaces: Option<RowId>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Loaded,
    Tracking,
    Receiving,
    Deduped,
}

/// Query-driven updater: applies hydration output against the CVR row set.
///
/// Entered with the target state version and the replica version the
/// hydration ran against. The legal call sequence is
/// `track_queries` → `received`* → `delete_unreferenced_rows` → `flush`;
/// anything else fails with [`UpdaterError::InvalidState`].
pub struct QueryUpdater {
    base: UpdaterBase,
    phase: Phase,
    state_version: StateVersion,
    executed: HashSet<QueryHash>,
    removed: HashSet<QueryHash>,
    /// New state of every row seen by `received` this update.
    received_rows: HashMap<RowId, RowRecord>,
    /// Dedup of repeated deliveries within this update.
    content_hashes: HashMap<RowId, String>,
    cancel: CancellationFlag,
}

impl QueryUpdater {
    /// Fails with `ReplicaVersionMismatch` when the CVR was hydrated against
    /// a different replica, unless it is still at the minimum version (first
    /// hydration adopts the replica).
    pub fn new(
        store: Arc<dyn CvrStore>,
        snapshot: CvrSnapshot,
        state_version: StateVersion,
        replica_version: &str,
        cancel: CancellationFlag,
    ) -> Result<Self, UpdaterError> {
        match &snapshot.cvr.replica_version {
            Some(stored) if stored != replica_version && !snapshot.cvr.version.is_min() => {
                return Err(StorageError::ReplicaVersionMismatch {
                    stored: Some(stored.clone()),
                    supplied: replica_version.to_owned(),
                }
                .into());
            }
            _ => {}
        }
        let mut base = UpdaterBase::new(store, snapshot);
        base.pending.replica_version = Some(replica_version.to_owned());
        Ok(QueryUpdater {
            base,
            phase: Phase::Loaded,
            state_version,
            executed: HashSet::new(),
            removed: HashSet::new(),
            received_rows: HashMap::new(),
            content_hashes: HashMap::new(),
            cancel,
        })
    }

    pub fn updated_version(&self) -> &CvrVersion {
        &self.base.new_version
    }

    /// Declares which queries this update hydrated (`executed`, with their
    /// transformation hashes) and which are gone (`removed`).
    #[instrument(skip_all, fields(client_group = %self.base.snapshot.cvr.id))]
    pub fn track_queries(
        &mut self,
        executed: &[(QueryHash, TransformationHash)],
        removed: &[QueryHash],
    ) -> Result<(CvrVersion, Vec<PatchToVersion>), UpdaterError> {
        if self.phase != Phase::Loaded {
            return Err(UpdaterError::InvalidState("track_queries after tracking began"));
        }
        self.phase = Phase::Tracking;
        let mut patches = Vec::new();

        for hash in removed {
            let live = self
                .base
                .snapshot
                .cvr
                .queries
                .get(hash)
                .map(|q| !q.deleted)
                .unwrap_or(false);
            if !live {
                continue;
            }
            let version = self.base.ensure_state_advance(&self.state_version);
            let (record, was_surfaced, desired_by) = {
                let query = self
                    .base
                    .snapshot
                    .cvr
                    .queries
                    .get_mut(hash)
                    .expect("checked above");
                let was_surfaced = query.is_got() && !query.internal;
                query.deleted = true;
                query.transformation_hash = None;
                query.transformation_version = None;
                query.patch_version = Some(version.clone());
                let desired_by = std::mem::take(&mut query.desired_by);
                (query.clone(), was_surfaced, desired_by)
            };
            for client_id in desired_by.into_keys() {
                if let Some(client) = self.base.snapshot.cvr.clients.get_mut(&client_id) {
                    client.desired_query_ids.remove(hash);
                    self.base.pending.clients.push(client.clone());
                }
                self.base.pending.desires.push(DesireRecord {
                    client_id,
                    hash: hash.clone(),
                    patch_version: version.clone(),
                    deleted: true,
                });
            }
            self.base.pending.queries.push(record);
            self.removed.insert(hash.clone());
            if was_surfaced {
                patches.push(PatchToVersion::config(
                    version,
                    ConfigPatch::DelQuery { hash: hash.clone() },
                ));
            }
        }

        for (hash, transformation_hash) in executed {
            let current = self
                .base
                .snapshot
                .cvr
                .queries
                .get(hash)
                .ok_or(UpdaterError::InvalidState("executed query unknown to the cvr"))?;
            self.executed.insert(hash.clone());
            if current.transformation_hash.as_ref() == Some(transformation_hash) {
                continue;
            }
            let version = self.base.ensure_state_advance(&self.state_version);
            let query = self
                .base
                .snapshot
                .cvr
                .queries
                .get_mut(hash)
                .expect("present above");
            query.transformation_hash = Some(transformation_hash.clone());
            query.transformation_version = Some(version.clone());
            let first_hydration = query.patch_version.is_none();
            if first_hydration {
                query.patch_version = Some(version.clone());
            }
            let query = query.clone();
            if first_hydration && !query.internal {
                patches.push(PatchToVersion::config(
                    version,
                    ConfigPatch::PutQuery { hash: hash.clone(), ast: query.ast.clone() },
                ));
            }
            self.base.pending.queries.push(query);
        }

        Ok((self.base.new_version.clone(), patches))
    }

    /// Applies a batch of hydration row deltas.
    ///
    /// A put patch is emitted when the row gains a reference it did not have,
    /// when its version advances, or when it continues under a renamed key.
    /// The patch is pinned to the row's effective patch version, which stays
    /// at its older value when only refcounts move; that is what keeps
    /// reconnect replay minimal.
    #[instrument(skip_all, fields(client_group = %self.base.snapshot.cvr.id, rows = rows.len()))]
    pub async fn received(
        &mut self,
        rows: Vec<ReceivedRow>,
    ) -> Result<Vec<PatchToVersion>, UpdaterError> {
        if !matches!(self.phase, Phase::Tracking | Phase::Receiving) {
            return Err(UpdaterError::InvalidState("received before track_queries"));
        }
        self.phase = Phase::Receiving;
        self.cancel.bail()?;

        let existing = self.lookup_rows(&rows).await?;
        let mut patches = Vec::new();
        let mut received = 0u64;

        for row in rows {
            let content_hash = content_hash(&row);
            if self.content_hashes.get(&row.id) == Some(&content_hash) {
                continue;
            }
            received += 1;

            // A signalled rename continues the prior record under the new
            // key; the old key is removed outright, never tombstoned.
            let renamed = row.replaces.is_some();
            let prior = match &row.replaces {
                Some(old_id) => {
                    let prior = self
                        .received_rows
                        .remove(old_id)
                        .or_else(|| existing.get(old_id).cloned());
                    self.base.pending.removed_rows.push(old_id.clone());
                    prior
                }
                None => self
                    .received_rows
                    .get(&row.id)
                    .cloned()
                    .or_else(|| existing.get(&row.id).cloned()),
            };

            let mut ref_counts =
                merge_ref_counts(prior.as_ref().and_then(|p| p.ref_counts.as_ref()), &row.ref_count_deltas);
            // References held by removed queries are dropped here for
            // received rows; the unreferenced-row walk handles the rest.
            if let Some(counts) = &mut ref_counts {
                counts.retain(|hash, _| !self.removed.contains(hash));
            }
            let ref_counts = ref_counts.filter(|counts| !counts.is_empty());

            let was_live = prior
                .as_ref()
                .map(|p| p.is_live())
                .unwrap_or(false);
            let now_live = ref_counts
                .as_ref()
                .map(|counts| counts.values().any(|c| *c > 0))
                .unwrap_or(false);
            let version_advanced = prior
                .as_ref()
                .map(|p| row.row_version > p.row_version)
                .unwrap_or(true);
            let gained_reference = row.ref_count_deltas.iter().any(|(hash, delta)| {
                *delta > 0
                    && prior
                        .as_ref()
                        .and_then(|p| p.ref_counts.as_ref())
                        .and_then(|counts| counts.get(hash))
                        .map(|count| *count <= 0)
                        .unwrap_or(true)
            });

            let patch_version = if version_advanced || was_live != now_live || renamed {
                self.base.ensure_state_advance(&self.state_version)
            } else {
                prior
                    .as_ref()
                    .map(|p| p.patch_version.clone())
                    .expect("unchanged row implies a prior record")
            };

            let record = RowRecord {
                id: row.id.clone(),
                row_version: row.row_version.clone(),
                patch_version,
                ref_counts,
            };
            self.content_hashes
                .insert(row.id.clone(), content_hash);
            if !renamed && Some(&record) == prior.as_ref() {
                // Nothing moved; re-delivery of a known state.
                self.received_rows.insert(row.id.clone(), record);
                continue;
            }

            if now_live && (version_advanced || gained_reference || renamed) {
                patches.push(PatchToVersion::row(
                    record.patch_version.clone(),
                    RowPatch::Put {
                        id: row.id.clone(),
                        row_version: row.row_version.clone(),
                        contents: row.contents.clone(),
                    },
                ));
            }
            self.base.pending.rows.push(record.clone());
            self.received_rows.insert(row.id, record);
        }

        counter!("rowsync_rows_received_total").increment(received);
        Ok(patches)
    }

    /// Walks the stored row set and tombstones every row whose references
    /// drained after `track_queries` and `received`: rows of removed queries,
    /// and rows an executed query no longer produced. Emits the matching del
    /// patches, including for rows that crossed to dead inside `received`.
    #[instrument(skip_all, fields(client_group = %self.base.snapshot.cvr.id))]
    pub async fn delete_unreferenced_rows(&mut self) -> Result<Vec<PatchToVersion>, UpdaterError> {
        if !matches!(self.phase, Phase::Tracking | Phase::Receiving) {
            return Err(UpdaterError::InvalidState(
                "delete_unreferenced_rows outside an active update",
            ));
        }
        self.phase = Phase::Deduped;
        let mut patches = Vec::new();

        // Rows that crossed live -> dead inside received().
        for record in self.received_rows.values() {
            if record.is_tombstone() {
                patches.push(PatchToVersion::row(
                    record.patch_version.clone(),
                    RowPatch::Del { id: record.id.clone() },
                ));
            }
        }

        if self.executed.is_empty() && self.removed.is_empty() {
            return Ok(patches);
        }

        let group = self.base.snapshot.cvr.id.clone();
        let mut stream = with_timeout("row_records", self.base.store.row_records(&group)).await?;
        let mut deleted = 0u64;
        while let Some(batch) = stream.next().await {
            self.cancel.bail()?;
            for record in batch? {
                if self.received_rows.contains_key(&record.id) || record.is_tombstone() {
                    continue;
                }
                let Some(counts) = &record.ref_counts else {
                    continue;
                };
                if !counts
                    .keys()
                    .any(|hash| self.executed.contains(hash) || self.removed.contains(hash))
                {
                    continue;
                }
                let mut remaining = counts.clone();
                remaining
                    .retain(|hash, _| !self.executed.contains(hash) && !self.removed.contains(hash));
                if remaining.is_empty() {
                    let version = self.base.ensure_state_advance(&self.state_version);
                    let tombstone = RowRecord {
                        id: record.id.clone(),
                        row_version: record.row_version.clone(),
                        patch_version: version.clone(),
                        ref_counts: None,
                    };
                    patches.push(PatchToVersion::row(
                        version,
                        RowPatch::Del { id: record.id.clone() },
                    ));
                    self.base.pending.rows.push(tombstone);
                    deleted += 1;
                } else {
                    // Some untracked query still holds the row; the refcount
                    // shrink is internal and keeps the patch version.
                    self.base.pending.rows.push(RowRecord {
                        ref_counts: Some(remaining),
                        ..record.clone()
                    });
                }
            }
        }
        counter!("rowsync_rows_deleted_total").increment(deleted);
        Ok(patches)
    }

    /// Persists the whole update in one transaction.
    pub async fn flush(
        mut self,
        now: NaiveDateTime,
    ) -> Result<(ClientViewRecord, FlushStats), UpdaterError> {
        if self.phase != Phase::Deduped {
            return Err(UpdaterError::InvalidState("flush before delete_unreferenced_rows"));
        }
        if !self.base.pending.rows.is_empty() || !self.base.pending.removed_rows.is_empty() {
            self.base.pending.rows_version = Some(self.base.new_version.clone());
        }
        debug!(version = %self.base.new_version, "flushing query-driven update");
        self.base.flush(now).await
    }

    async fn lookup_rows(
        &self,
        rows: &[ReceivedRow],
    ) -> Result<HashMap<RowId, RowRecord>, UpdaterError> {
        let wanted: Vec<RowId> = rows
            .iter()
            .flat_map(|row| {
                std::iter::once(row.id.clone()).chain(row.replaces.iter().cloned())
            })
            .filter(|id| !self.received_rows.contains_key(id))
            .collect();
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }
        let group = self.base.snapshot.cvr.id.clone();
        let records =
            with_timeout("load_rows", self.base.store.load_rows(&group, &wanted)).await?;
        Ok(records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect())
    }
}

/// Dedup key for repeated deliveries: contents, row version and the deltas.
/// Two deliveries differing only in deltas are distinct (overlapping queries
/// legitimately report the same contents).
fn content_hash(row: &ReceivedRow) -> String {
    let mut buf = serde_json::to_vec(&row.contents).expect("row contents are always serializable");
    buf.extend_from_slice(row.row_version.as_bytes());
    buf.extend_from_slice(
        &serde_json::to_vec(&row.ref_count_deltas).expect("ref counts are always serializable"),
    );
    h128_hex(&buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::updater::{test_support::*, ConfigUpdater};
    use maplit::btreemap;
    use rowsync_core::models::{
        ast::QueryAst,
        cvr::KeyValue,
        patch::Patch,
    };
    use rowsync_storage::memory::MemoryCvrStore;
    use serde_json::json;

    fn row_id(key: &str) -> RowId {
        RowId::new(
            "public",
            "issues",
            btreemap! { "id".to_string() => KeyValue::Text(key.to_string()) },
        )
    }

    fn received_row(key: &str, version: &str, deltas: RefCounts) -> ReceivedRow {
        ReceivedRow {
            id: row_id(key),
            row_version: version.to_string(),
            contents: json!({"id": key, "title": "t"}),
            ref_count_deltas: deltas,
            replaces: None,
        }
    }

    /// Seeds a group where c1 desires q1 over the issues table.
    async fn seed_desired(store: &Arc<MemoryCvrStore>, queries: &[&str]) {
        let snapshot = fresh_snapshot(store, "g1").await;
        let mut updater = ConfigUpdater::new(store.clone(), snapshot);
        let desired = queries
            .iter()
            .map(|q| ((*q).to_string(), QueryAst::table("issues")))
            .collect();
        updater.put_desired_queries(&"c1".to_string(), &desired);
        updater
            .flush(ts("2024-05-13T10:00:01"))
            .await
            .unwrap();
    }

    fn query_updater(
        store: &Arc<MemoryCvrStore>,
        snapshot: rowsync_core::storage::CvrSnapshot,
        seq: u64,
    ) -> QueryUpdater {
        QueryUpdater::new(
            store.clone() as Arc<dyn CvrStore>,
            snapshot,
            StateVersion::from_sequence(seq),
            "replica-1",
            CancellationFlag::new(),
        )
        .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_initial_hydration() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let config_version = snapshot.cvr.version.clone();

        let mut updater = query_updater(&store, snapshot, 1);
        let (version, query_patches) = updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        let row_patches = updater
            .received(vec![received_row("123", "03", btreemap! { "q1".to_string() => 1 })])
            .await
            .unwrap();
        let del_patches = updater.delete_unreferenced_rows().await.unwrap();
        let (cvr, _) = updater
            .flush(ts("2024-05-13T10:00:03"))
            .await
            .unwrap();

        // State version advanced past the config-only version.
        assert!(version > config_version);
        assert_eq!(version.minor_version, 0);
        assert_eq!(cvr.version, version);
        assert_eq!(query_patches.len(), 1);
        assert!(matches!(
            &query_patches[0].patch,
            Patch::Config(ConfigPatch::PutQuery { hash, .. }) if hash == "q1"
        ));
        assert_eq!(row_patches.len(), 1);
        assert!(del_patches.is_empty());

        let rows = store
            .load_rows(&"g1".to_string(), &[row_id("123")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_live());
        assert_eq!(rows[0].row_version, "03");
        assert_eq!(store.rows_version(&"g1".to_string()).await, Some(version));

        let reloaded = reload(&store, "g1", "2024-05-13T10:00:04").await;
        reloaded.cvr.check_invariants().unwrap();
        assert!(reloaded.cvr.queries["q1"].is_got());
    }

    #[test_log::test(tokio::test)]
    async fn test_overlapping_queries_share_rows() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1", "q2"]).await;

        // Both queries hydrate the same row.
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let mut updater = query_updater(&store, snapshot, 1);
        updater
            .track_queries(
                &[("q1".to_string(), "h1".to_string()), ("q2".to_string(), "h2".to_string())],
                &[],
            )
            .unwrap();
        let patches = updater
            .received(vec![
                received_row("123", "03", btreemap! { "q1".to_string() => 1 }),
                received_row("123", "03", btreemap! { "q2".to_string() => 1 }),
            ])
            .await
            .unwrap();
        updater.delete_unreferenced_rows().await.unwrap();
        updater
            .flush(ts("2024-05-13T10:00:03"))
            .await
            .unwrap();

        // The second delivery is a new reference for q2 but the row was
        // already present; its patch stays at the already-assigned version.
        assert_eq!(patches.len(), 2);
        let rows = store
            .load_rows(&"g1".to_string(), &[row_id("123")])
            .await
            .unwrap();
        assert_eq!(
            rows[0].ref_counts,
            Some(btreemap! { "q1".to_string() => 1, "q2".to_string() => 1 })
        );

        // Removing q1 leaves the row live.
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:04").await;
        let mut updater = query_updater(&store, snapshot, 2);
        updater
            .track_queries(&[], &["q1".to_string()])
            .unwrap();
        let dels = updater.delete_unreferenced_rows().await.unwrap();
        updater
            .flush(ts("2024-05-13T10:00:05"))
            .await
            .unwrap();
        assert!(dels.is_empty());
        let rows = store
            .load_rows(&"g1".to_string(), &[row_id("123")])
            .await
            .unwrap();
        assert!(rows[0].is_live());
        assert_eq!(rows[0].ref_counts, Some(btreemap! { "q2".to_string() => 1 }));

        // Removing q2 tombstones it.
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:06").await;
        let mut updater = query_updater(&store, snapshot, 3);
        updater
            .track_queries(&[], &["q2".to_string()])
            .unwrap();
        let dels = updater.delete_unreferenced_rows().await.unwrap();
        let (cvr, _) = updater
            .flush(ts("2024-05-13T10:00:07"))
            .await
            .unwrap();
        assert_eq!(dels.len(), 1);
        let rows = store
            .load_rows(&"g1".to_string(), &[row_id("123")])
            .await
            .unwrap();
        assert!(rows[0].is_tombstone());
        assert_eq!(rows[0].patch_version, cvr.version);
    }

    #[tokio::test]
    async fn test_retransformation_changes() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let mut updater = query_updater(&store, snapshot, 1);
        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        updater
            .received(vec![
                received_row("1", "01", btreemap! { "q1".to_string() => 1 }),
                received_row("2", "01", btreemap! { "q1".to_string() => 1 }),
            ])
            .await
            .unwrap();
        updater.delete_unreferenced_rows().await.unwrap();
        updater
            .flush(ts("2024-05-13T10:00:03"))
            .await
            .unwrap();

        // Re-hydrate under h2: row 1 unchanged, row 2 absent, row 3 fresh.
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:04").await;
        let mut updater = query_updater(&store, snapshot, 2);
        updater
            .track_queries(&[("q1".to_string(), "h2".to_string())], &[])
            .unwrap();
        let puts = updater
            .received(vec![
                received_row("1", "01", btreemap! { "q1".to_string() => 0 }),
                received_row("3", "02", btreemap! { "q1".to_string() => 1 }),
            ])
            .await
            .unwrap();
        let dels = updater.delete_unreferenced_rows().await.unwrap();
        updater
            .flush(ts("2024-05-13T10:00:05"))
            .await
            .unwrap();

        // Unchanged row produces no patch; the fresh row one put; the row the
        // new transformation no longer produces is tombstoned.
        assert_eq!(puts.len(), 1);
        assert!(matches!(
            &puts[0].patch,
            Patch::Row(RowPatch::Put { id, .. }) if *id == row_id("3")
        ));
        assert_eq!(dels.len(), 1);
        assert!(matches!(
            &dels[0].patch,
            Patch::Row(RowPatch::Del { id }) if *id == row_id("2")
        ));
        let rows = store
            .load_rows(&"g1".to_string(), &[row_id("1"), row_id("2"), row_id("3")])
            .await
            .unwrap();
        let by_key = |key: &str| {
            rows.iter()
                .find(|r| r.id == row_id(key))
                .unwrap()
        };
        assert!(by_key("1").is_live());
        assert!(by_key("2").is_tombstone());
        assert!(by_key("3").is_live());
    }

    #[tokio::test]
    async fn test_version_advance_produces_put() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let mut updater = query_updater(&store, snapshot, 1);
        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        updater
            .received(vec![received_row("1", "01", btreemap! { "q1".to_string() => 1 })])
            .await
            .unwrap();
        updater.delete_unreferenced_rows().await.unwrap();
        updater
            .flush(ts("2024-05-13T10:00:03"))
            .await
            .unwrap();

        let snapshot = reload(&store, "g1", "2024-05-13T10:00:04").await;
        let mut updater = query_updater(&store, snapshot, 2);
        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        let puts = updater
            .received(vec![received_row("1", "02", btreemap! { "q1".to_string() => 0 })])
            .await
            .unwrap();
        updater.delete_unreferenced_rows().await.unwrap();
        let (cvr, _) = updater
            .flush(ts("2024-05-13T10:00:05"))
            .await
            .unwrap();

        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].to_version, cvr.version);
    }

    #[tokio::test]
    async fn test_received_is_idempotent() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let mut updater = query_updater(&store, snapshot, 1);
        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();

        let row = received_row("1", "01", btreemap! { "q1".to_string() => 1 });
        let first = updater.received(vec![row.clone()]).await.unwrap();
        let second = updater.received(vec![row]).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        updater.delete_unreferenced_rows().await.unwrap();
        let (cvr, _) = updater
            .flush(ts("2024-05-13T10:00:03"))
            .await
            .unwrap();
        let rows = store
            .load_rows(&"g1".to_string(), &[row_id("1")])
            .await
            .unwrap();
        assert_eq!(rows[0].ref_counts, Some(btreemap! { "q1".to_string() => 1 }));
        cvr.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_row_key_rename_preserves_refcounts() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let mut updater = query_updater(&store, snapshot, 1);
        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        updater
            .received(vec![received_row("123", "01", btreemap! { "q1".to_string() => 1 })])
            .await
            .unwrap();
        updater.delete_unreferenced_rows().await.unwrap();
        updater
            .flush(ts("2024-05-13T10:00:03"))
            .await
            .unwrap();

        let snapshot = reload(&store, "g1", "2024-05-13T10:00:04").await;
        let mut updater = query_updater(&store, snapshot, 2);
        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        let renamed = ReceivedRow {
            replaces: Some(row_id("123")),
            ref_count_deltas: btreemap! { "q1".to_string() => 0 },
            ..received_row("1foo", "01", btreemap! {})
        };
        let puts = updater.received(vec![renamed]).await.unwrap();
        updater.delete_unreferenced_rows().await.unwrap();
        let (cvr, _) = updater
            .flush(ts("2024-05-13T10:00:05"))
            .await
            .unwrap();

        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].to_version, cvr.version);
        let rows = store
            .load_rows(&"g1".to_string(), &[row_id("123"), row_id("1foo")])
            .await
            .unwrap();
        // Old key is gone outright, new key carries the references.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, row_id("1foo"));
        assert_eq!(rows[0].ref_counts, Some(btreemap! { "q1".to_string() => 1 }));
    }

    #[tokio::test]
    async fn test_out_of_order_calls_are_rejected() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let mut updater = query_updater(&store, snapshot, 1);

        let res = updater.received(vec![]).await;
        assert!(matches!(res, Err(UpdaterError::InvalidState(_))));

        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        let res = updater.track_queries(&[], &[]);
        assert!(matches!(res, Err(UpdaterError::InvalidState(_))));

        updater.delete_unreferenced_rows().await.unwrap();
        let res = updater.received(vec![]).await;
        assert!(matches!(res, Err(UpdaterError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_replica_mismatch_is_refused() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let snapshot = reload(&store, "g1", "2024-05-13T10:00:02").await;
        let mut updater = query_updater(&store, snapshot, 1);
        updater
            .track_queries(&[("q1".to_string(), "h1".to_string())], &[])
            .unwrap();
        updater.delete_unreferenced_rows().await.unwrap();
        updater
            .flush(ts("2024-05-13T10:00:03"))
            .await
            .unwrap();

        let snapshot = reload(&store, "g1", "2024-05-13T10:00:04").await;
        let res = QueryUpdater::new(
            store.clone() as Arc<dyn CvrStore>,
            snapshot,
            StateVersion::from_sequence(2),
            "replica-2",
            CancellationFlag::new(),
        );

        assert!(matches!(
            res,
            Err(UpdaterError::Storage(StorageError::ReplicaVersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_versions_strictly_increase_across_flushes() {
        let store = Arc::new(MemoryCvrStore::new());
        seed_desired(&store, &["q1"]).await;
        let mut versions = vec![CvrVersion::min()];

        for (seq, at) in [(1u64, "10:00:02"), (1, "10:00:04"), (2, "10:00:06")] {
            let snapshot = reload(&store, "g1", &format!("2024-05-13T{at}")).await;
            let mut updater = query_updater(&store, snapshot, seq);
            updater
                .track_queries(&[("q1".to_string(), format!("h-{at}"))], &[])
                .unwrap();
            updater.delete_unreferenced_rows().await.unwrap();
            let (cvr, _) = updater
                .flush(ts(&format!("2024-05-13T{at}")))
                .await
                .unwrap();
            versions.push(cvr.version);
        }

        for pair in versions.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }
}
