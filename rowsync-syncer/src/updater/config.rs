use super::{UpdaterBase, UpdaterError};
use chrono::NaiveDateTime;
use rowsync_core::{
    models::{
        ast::QueryAst,
        cvr::{ClientRecord, ClientViewRecord, QueryRecord},
        patch::{ConfigPatch, PatchToVersion},
        ClientId, QueryHash,
    },
    storage::{CvrSnapshot, CvrStore, DesireRecord, FlushStats},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::instrument;

/// Config-driven updater: edits which queries which clients desire.
///
/// Any effective change advances the CVR to the next minor version, exactly
/// once per update; the returned patches describe the externally visible
/// effects in insertion order.
pub struct ConfigUpdater {
    base: UpdaterBase,
}

impl ConfigUpdater {
    pub fn new(store: Arc<dyn CvrStore>, snapshot: CvrSnapshot) -> Self {
        ConfigUpdater { base: UpdaterBase::new(store, snapshot) }
    }

    /// Registers `queries` as desired by `client_id`, creating the client and
    /// any unknown queries on the way. Queries already desired by the client
    /// are left untouched. A soft-deleted query is resurrected as "not got":
    /// its transformation state resets and it re-hydrates from scratch.
    #[instrument(skip_all, fields(client_id))]
    pub fn put_desired_queries(
        &mut self,
        client_id: &ClientId,
        queries: &BTreeMap<QueryHash, QueryAst>,
    ) -> Vec<PatchToVersion> {
        let mut patches = Vec::new();
        self.ensure_client(client_id, &mut patches);

        for (hash, ast) in queries {
            let already_desired = self
                .base
                .snapshot
                .cvr
                .clients
                .get(client_id)
                .map(|c| c.desired_query_ids.contains(hash))
                .unwrap_or(false);
            if already_desired {
                continue;
            }
            let version = self.base.ensure_minor_advance();

            let query = self
                .base
                .snapshot
                .cvr
                .queries
                .entry(hash.clone())
                .or_insert_with(|| QueryRecord::new(hash, ast.clone()));
            if query.deleted {
                // Resurrection resets the query to "not got"; prior
                // transformation state must not leak across the gap.
                query.deleted = false;
                query.ast = ast.clone();
                query.transformation_hash = None;
                query.transformation_version = None;
                query.patch_version = None;
            }
            query
                .desired_by
                .insert(client_id.clone(), version.clone());
            let query = query.clone();
            self.base.pending.queries.push(query);

            let client = self
                .base
                .snapshot
                .cvr
                .clients
                .get_mut(client_id)
                .expect("client ensured above");
            client.desired_query_ids.insert(hash.clone());
            self.base.pending.clients.push(client.clone());

            self.base.pending.desires.push(DesireRecord {
                client_id: client_id.clone(),
                hash: hash.clone(),
                patch_version: version.clone(),
                deleted: false,
            });
            patches.push(PatchToVersion::config(
                version,
                ConfigPatch::PutDesire {
                    client_id: client_id.clone(),
                    hash: hash.clone(),
                    ast: ast.clone(),
                },
            ));
        }
        patches
    }

    /// Drops desires of `client_id` for the given queries. A query left with
    /// no desiring client and no hydration state is soft-deleted.
    #[instrument(skip_all, fields(client_id))]
    pub fn delete_desired_queries(
        &mut self,
        client_id: &ClientId,
        hashes: &[QueryHash],
    ) -> Vec<PatchToVersion> {
        let mut patches = Vec::new();
        for hash in hashes {
            let desired = self
                .base
                .snapshot
                .cvr
                .clients
                .get(client_id)
                .map(|c| c.desired_query_ids.contains(hash))
                .unwrap_or(false);
            if !desired {
                continue;
            }
            let version = self.base.ensure_minor_advance();

            let client = self
                .base
                .snapshot
                .cvr
                .clients
                .get_mut(client_id)
                .expect("desire implies client");
            client.desired_query_ids.remove(hash);
            self.base.pending.clients.push(client.clone());

            let query = self
                .base
                .snapshot
                .cvr
                .queries
                .get_mut(hash)
                .expect("desire implies query");
            query.desired_by.remove(client_id);
            if query.desired_by.is_empty() && !query.is_got() && !query.internal {
                query.deleted = true;
                query.patch_version = Some(version.clone());
            }
            self.base.pending.queries.push(query.clone());

            self.base.pending.desires.push(DesireRecord {
                client_id: client_id.clone(),
                hash: hash.clone(),
                patch_version: version.clone(),
                deleted: true,
            });
            patches.push(PatchToVersion::config(
                version,
                ConfigPatch::DelDesire { client_id: client_id.clone(), hash: hash.clone() },
            ));
        }
        patches
    }

    /// Equivalent to deleting every query the client currently desires.
    pub fn clear_desired_queries(&mut self, client_id: &ClientId) -> Vec<PatchToVersion> {
        let hashes: Vec<QueryHash> = self
            .base
            .snapshot
            .cvr
            .clients
            .get(client_id)
            .map(|c| c.desired_query_ids.iter().cloned().collect())
            .unwrap_or_default();
        self.delete_desired_queries(client_id, &hashes)
    }

    pub async fn flush(
        self,
        now: NaiveDateTime,
    ) -> Result<(ClientViewRecord, FlushStats), UpdaterError> {
        self.base.flush(now).await
    }

    fn ensure_client(&mut self, client_id: &ClientId, patches: &mut Vec<PatchToVersion>) {
        let known = self
            .base
            .snapshot
            .cvr
            .clients
            .get(client_id)
            .map(|c| !c.deleted)
            .unwrap_or(false);
        if known {
            return;
        }
        let version = self.base.ensure_minor_advance();
        let record = ClientRecord::new(client_id, version.clone());
        self.base
            .snapshot
            .cvr
            .clients
            .insert(client_id.clone(), record.clone());
        self.base.pending.clients.push(record);
        patches.push(PatchToVersion::config(
            version,
            ConfigPatch::PutClient { client_id: client_id.clone() },
        ));
    }
}
