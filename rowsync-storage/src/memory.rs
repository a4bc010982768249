//! In-memory CVR store.
//!
//! Implements the same `CvrStore` contract as the postgres backend, including
//! ownership fencing and optimistic concurrency, over plain maps behind a
//! mutex. Used by the syncer test-suite and by embedded single-process
//! deployments where durability is not required.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::{stream, StreamExt};
use rowsync_core::{
    models::{
        cvr::{ClientRecord, ClientViewRecord, QueryRecord, RowId, RowRecord},
        patch::{ConfigPatch, PatchToVersion},
        version::CvrVersion,
        ClientGroupId, ClientId, QueryHash,
    },
    storage::{
        ConfigPatchStream, CvrSnapshot, CvrStore, DesireRecord, FlushStats, PendingChanges,
        RowRecordStream, StorageError,
    },
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::Mutex;

const ROW_BATCH_SIZE: usize = 1000;

#[derive(Debug, Default)]
struct GroupState {
    version: CvrVersion,
    replica_version: Option<String>,
    last_active: Option<NaiveDateTime>,
    owner: String,
    granted_at: Option<NaiveDateTime>,
    clients: BTreeMap<ClientId, ClientRecord>,
    queries: BTreeMap<QueryHash, QueryRecord>,
    desires: BTreeMap<(ClientId, QueryHash), DesireRecord>,
    rows: BTreeMap<RowId, RowRecord>,
    rows_version: Option<CvrVersion>,
}

/// Mutex-guarded map of group states; all trait methods lock, copy what they
/// need, and release before returning, so streams never hold the lock.
#[derive(Clone, Default)]
pub struct MemoryCvrStore {
    state: Arc<Mutex<HashMap<ClientGroupId, GroupState>>>,
}

impl MemoryCvrStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: the stored rows-version index for a group.
    pub async fn rows_version(&self, client_group: &ClientGroupId) -> Option<CvrVersion> {
        let state = self.state.lock().await;
        state
            .get(client_group)
            .and_then(|group| group.rows_version.clone())
    }
}

fn assemble_cvr(group_id: &ClientGroupId, group: &GroupState) -> ClientViewRecord {
    let mut cvr = ClientViewRecord {
        id: group_id.clone(),
        version: group.version.clone(),
        replica_version: group.replica_version.clone(),
        last_active: group
            .last_active
            .unwrap_or_else(|| NaiveDateTime::from_timestamp_opt(0, 0).expect("epoch exists")),
        clients: group.clients.clone(),
        queries: group.queries.clone(),
    };
    // Cross references are derived from the desires table, exactly like the
    // relational backend does.
    for client in cvr.clients.values_mut() {
        client.desired_query_ids.clear();
    }
    for query in cvr.queries.values_mut() {
        query.desired_by.clear();
    }
    for desire in group.desires.values().filter(|d| !d.deleted) {
        if let (Some(client), Some(query)) = (
            cvr.clients.get_mut(&desire.client_id),
            cvr.queries.get_mut(&desire.hash),
        ) {
            if !client.deleted && !query.deleted {
                client.desired_query_ids.insert(desire.hash.clone());
                query
                    .desired_by
                    .insert(desire.client_id.clone(), desire.patch_version.clone());
            }
        }
    }
    cvr
}

#[async_trait]
impl CvrStore for MemoryCvrStore {
    async fn load(
        &self,
        client_group: &ClientGroupId,
        owner: &str,
        last_connect: NaiveDateTime,
    ) -> Result<CvrSnapshot, StorageError> {
        let mut state = self.state.lock().await;
        let group = state.entry(client_group.clone()).or_default();

        match group.granted_at {
            Some(granted_at)
                if granted_at > last_connect
                    || (granted_at == last_connect && group.owner != owner) =>
            {
                return Err(StorageError::Ownership {
                    owner: group.owner.clone(),
                    granted_at,
                });
            }
            Some(granted_at) if granted_at == last_connect => {}
            _ => {
                group.owner = owner.to_owned();
                group.granted_at = Some(last_connect);
            }
        }
        if group.last_active.is_none() {
            group.last_active = Some(last_connect);
        }

        Ok(CvrSnapshot {
            cvr: assemble_cvr(client_group, group),
            owner: owner.to_owned(),
            granted_at: last_connect,
        })
    }

    async fn flush(
        &self,
        snapshot: &CvrSnapshot,
        pending: PendingChanges,
        now: NaiveDateTime,
    ) -> Result<FlushStats, StorageError> {
        let mut state = self.state.lock().await;
        let group = state.get_mut(&snapshot.cvr.id).ok_or_else(|| {
            StorageError::NotFound("CvrInstance".to_string(), snapshot.cvr.id.clone())
        })?;

        if group.owner != snapshot.owner || group.granted_at != Some(snapshot.granted_at) {
            return Err(StorageError::Ownership {
                owner: group.owner.clone(),
                granted_at: group.granted_at.unwrap_or(snapshot.granted_at),
            });
        }
        if group.version != snapshot.cvr.version {
            return Err(StorageError::ConcurrentModification {
                expected: snapshot.cvr.version.to_string(),
                actual: group.version.to_string(),
            });
        }

        let stats = FlushStats {
            clients: pending.clients.len(),
            queries: pending.queries.len(),
            desires: pending.desires.len(),
            rows: pending.rows.len(),
        };

        for client in pending.clients {
            group.clients.insert(client.id.clone(), client);
        }
        for query in pending.queries {
            group.queries.insert(query.hash.clone(), query);
        }
        for desire in pending.desires {
            group
                .desires
                .insert((desire.client_id.clone(), desire.hash.clone()), desire);
        }
        for id in &pending.removed_rows {
            group.rows.remove(id);
        }
        for row in pending.rows {
            group.rows.insert(row.id.clone(), row);
        }
        if let Some(rows_version) = pending.rows_version {
            group.rows_version = Some(rows_version);
        }
        group.version = pending.version;
        group.replica_version = pending.replica_version;
        group.last_active = Some(now);

        Ok(stats)
    }

    async fn purge(&self, client_group: &ClientGroupId) -> Result<(), StorageError> {
        self.state.lock().await.remove(client_group);
        Ok(())
    }

    async fn load_rows(
        &self,
        client_group: &ClientGroupId,
        ids: &[RowId],
    ) -> Result<Vec<RowRecord>, StorageError> {
        let state = self.state.lock().await;
        let Some(group) = state.get(client_group) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| group.rows.get(id).cloned())
            .collect())
    }

    async fn row_records(
        &self,
        client_group: &ClientGroupId,
    ) -> Result<RowRecordStream, StorageError> {
        let state = self.state.lock().await;
        let rows: Vec<RowRecord> = state
            .get(client_group)
            .map(|group| group.rows.values().cloned().collect())
            .unwrap_or_default();
        let batches: Vec<Result<Vec<RowRecord>, StorageError>> = rows
            .chunks(ROW_BATCH_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(stream::iter(batches).boxed())
    }

    async fn catchup_config_patches(
        &self,
        client_group: &ClientGroupId,
        after: &CvrVersion,
        current: &CvrVersion,
    ) -> Result<ConfigPatchStream, StorageError> {
        let state = self.state.lock().await;
        let Some(group) = state.get(client_group) else {
            return Ok(stream::iter(Vec::new()).boxed());
        };

        let in_window = |version: &CvrVersion| -> bool { version > after && version <= current };
        let mut patches: Vec<PatchToVersion> = Vec::new();

        for client in group.clients.values() {
            if !in_window(&client.patch_version) {
                continue;
            }
            let patch = if client.deleted {
                ConfigPatch::DelClient {
                    client_id: client.id.clone(),
                }
            } else {
                ConfigPatch::PutClient {
                    client_id: client.id.clone(),
                }
            };
            patches.push(PatchToVersion::config(client.patch_version.clone(), patch));
        }
        for query in group.queries.values().filter(|q| !q.internal) {
            let Some(patch_version) = &query.patch_version else {
                continue;
            };
            if !in_window(patch_version) {
                continue;
            }
            let patch = if query.deleted {
                ConfigPatch::DelQuery {
                    hash: query.hash.clone(),
                }
            } else {
                ConfigPatch::PutQuery {
                    hash: query.hash.clone(),
                    ast: query.ast.clone(),
                }
            };
            patches.push(PatchToVersion::config(patch_version.clone(), patch));
        }
        for desire in group.desires.values() {
            if !in_window(&desire.patch_version) {
                continue;
            }
            let patch = if desire.deleted {
                ConfigPatch::DelDesire {
                    client_id: desire.client_id.clone(),
                    hash: desire.hash.clone(),
                }
            } else {
                let Some(query) = group.queries.get(&desire.hash) else {
                    continue;
                };
                ConfigPatch::PutDesire {
                    client_id: desire.client_id.clone(),
                    hash: desire.hash.clone(),
                    ast: query.ast.clone(),
                }
            };
            patches.push(PatchToVersion::config(desire.patch_version.clone(), patch));
        }

        patches.sort_by(|a, b| a.to_version.cmp(&b.to_version));
        Ok(stream::iter(patches.into_iter().map(Ok)).boxed())
    }

    async fn catchup_row_patches(
        &self,
        client_group: &ClientGroupId,
        after: &CvrVersion,
        current: &CvrVersion,
        exclude_queries: &[QueryHash],
    ) -> Result<RowRecordStream, StorageError> {
        let state = self.state.lock().await;
        let Some(group) = state.get(client_group) else {
            return Ok(stream::iter(Vec::new()).boxed());
        };
        let excluded: HashSet<&QueryHash> = exclude_queries.iter().collect();

        let rows: Vec<RowRecord> = group
            .rows
            .values()
            .filter(|row| row.patch_version > *after && row.patch_version <= *current)
            .filter(|row| match &row.ref_counts {
                None => true,
                Some(ref_counts) => {
                    excluded.is_empty() || !ref_counts.keys().all(|hash| excluded.contains(hash))
                }
            })
            .cloned()
            .collect();

        let batches: Vec<Result<Vec<RowRecord>, StorageError>> = rows
            .chunks(ROW_BATCH_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(stream::iter(batches).boxed())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;
    use rowsync_core::models::{ast::QueryAst, version::StateVersion};

    fn ts(raw: &str) -> NaiveDateTime {
        raw.parse().unwrap()
    }

    fn version(seq: u64, minor: u32) -> CvrVersion {
        CvrVersion::new(StateVersion::from_sequence(seq), minor)
    }

    #[tokio::test]
    async fn test_load_creates_group_at_min() {
        let store = MemoryCvrStore::new();

        let snapshot = store
            .load(&"g1".to_string(), "task-a", ts("2024-05-13T10:00:00"))
            .await
            .unwrap();

        assert_eq!(snapshot.cvr.version, CvrVersion::min());
        assert!(snapshot.cvr.clients.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_flush_and_reload_round_trip() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_string();
        let snapshot = store
            .load(&group, "task-a", ts("2024-05-13T10:00:00"))
            .await
            .unwrap();

        let v1 = version(1, 0);
        let mut client = ClientRecord::new(&"c1".to_string(), v1.clone());
        client.desired_query_ids.insert("q1".to_string());
        let mut query = QueryRecord::new(&"q1".to_string(), QueryAst::table("issues"));
        query.desired_by.insert("c1".to_string(), v1.clone());
        let pending = PendingChanges {
            version: v1.clone(),
            replica_version: Some("r1".to_string()),
            clients: vec![client.clone()],
            queries: vec![query.clone()],
            desires: vec![DesireRecord {
                client_id: "c1".to_string(),
                hash: "q1".to_string(),
                patch_version: v1.clone(),
                deleted: false,
            }],
            ..Default::default()
        };
        store
            .flush(&snapshot, pending, ts("2024-05-13T10:00:01"))
            .await
            .unwrap();

        let reloaded = store
            .load(&group, "task-a", ts("2024-05-13T10:00:02"))
            .await
            .unwrap();

        assert_eq!(reloaded.cvr.version, v1);
        assert_eq!(reloaded.cvr.clients["c1"], client);
        assert_eq!(reloaded.cvr.queries["q1"], query);
        reloaded.cvr.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_string();
        let snapshot = store
            .load(&group, "task-a", ts("2024-05-13T10:00:00"))
            .await
            .unwrap();

        let pending = PendingChanges {
            version: version(1, 0),
            ..Default::default()
        };
        store
            .flush(&snapshot, pending, ts("2024-05-13T10:00:01"))
            .await
            .unwrap();

        // Second flush from the same (now stale) snapshot.
        let res = store
            .flush(
                &snapshot,
                PendingChanges {
                    version: version(2, 0),
                    ..Default::default()
                },
                ts("2024-05-13T10:00:02"),
            )
            .await;

        assert!(matches!(
            res,
            Err(StorageError::ConcurrentModification { .. })
        ));
    }

    #[tokio::test]
    async fn test_newer_lease_fences_old_owner() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_string();
        let old = store
            .load(&group, "task-a", ts("2024-05-13T10:00:00"))
            .await
            .unwrap();
        store
            .load(&group, "task-b", ts("2024-05-13T10:00:05"))
            .await
            .unwrap();

        let res = store
            .flush(
                &old,
                PendingChanges {
                    version: version(1, 0),
                    ..Default::default()
                },
                ts("2024-05-13T10:00:06"),
            )
            .await;
        let stale_load = store
            .load(&group, "task-a", ts("2024-05-13T10:00:04"))
            .await;

        assert!(matches!(res, Err(StorageError::Ownership { .. })));
        assert!(matches!(stale_load, Err(StorageError::Ownership { .. })));
    }

    #[tokio::test]
    async fn test_purge_removes_every_trace_of_the_group() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_string();
        let snapshot = store
            .load(&group, "task-a", ts("2024-05-13T10:00:00"))
            .await
            .unwrap();
        let v1 = version(1, 0);
        let pending = PendingChanges {
            version: v1.clone(),
            clients: vec![ClientRecord::new(&"c1".to_string(), v1.clone())],
            rows_version: Some(v1),
            ..Default::default()
        };
        store
            .flush(&snapshot, pending, ts("2024-05-13T10:00:01"))
            .await
            .unwrap();

        store.purge(&group).await.unwrap();

        assert_eq!(store.rows_version(&group).await, None);
        // A later load starts from scratch at the minimum version.
        let fresh = store
            .load(&group, "task-b", ts("2024-05-13T10:00:02"))
            .await
            .unwrap();
        assert_eq!(fresh.cvr.version, CvrVersion::min());
        assert!(fresh.cvr.clients.is_empty());
    }

    #[tokio::test]
    async fn test_catchup_row_patches_excludes_hydrated_queries() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_string();
        let snapshot = store
            .load(&group, "task-a", ts("2024-05-13T10:00:00"))
            .await
            .unwrap();

        let v1 = version(1, 0);
        let row = |key: i64, ref_counts: Option<&str>| RowRecord {
            id: RowId::new(
                "public",
                "issues",
                btreemap! { "id".to_string() => rowsync_core::models::cvr::KeyValue::Int(key) },
            ),
            row_version: "01".to_string(),
            patch_version: v1.clone(),
            ref_counts: ref_counts.map(|hash| btreemap! { hash.to_string() => 1 }),
        };
        let pending = PendingChanges {
            version: v1.clone(),
            rows: vec![row(1, Some("q1")), row(2, Some("q2")), row(3, None)],
            rows_version: Some(v1.clone()),
            ..Default::default()
        };
        store
            .flush(&snapshot, pending, ts("2024-05-13T10:00:01"))
            .await
            .unwrap();

        let mut stream = store
            .catchup_row_patches(&group, &CvrVersion::min(), &v1, &["q1".to_string()])
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(batch) = stream.next().await {
            seen.extend(batch.unwrap());
        }

        // q1-only row is delivered by hydration; the q2 row and the tombstone
        // both replay through catch-up.
        let keys: Vec<_> = seen
            .iter()
            .map(|r| r.id.row_key.values().next().unwrap().primitive_string())
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"2".to_string()));
        assert!(keys.contains(&"3".to_string()));
    }
}
