use super::{
    orm::{
        self, StoredClient, StoredDesire, StoredInstance, StoredQuery, StoredRow, StoredRowsVersion,
    },
    schema::{cvr_clients, cvr_desires, cvr_instances, cvr_queries, cvr_rows, cvr_rows_version},
    PostgresError,
};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel::{prelude::*, upsert::excluded};
use diesel_async::{
    pooled_connection::deadpool::Pool, scoped_futures::ScopedFutureExt, AsyncConnection,
    AsyncPgConnection, RunQueryDsl,
};
use futures::{stream, StreamExt};
use rowsync_core::{
    models::{
        cvr::{ClientViewRecord, RowId, RowRecord},
        patch::{ConfigPatch, PatchToVersion},
        version::CvrVersion,
        ClientGroupId, QueryHash,
    },
    storage::{
        ConfigPatchStream, CvrSnapshot, CvrStore, FlushStats, PendingChanges, RowRecordStream,
        StorageError,
    },
};
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Rows are scanned in pages of this size. The owning syncer serializes
/// writes to a group, so pagination over a quiescent table is stable.
const ROW_PAGE_SIZE: i64 = 1000;

/// Postgres-backed [`CvrStore`].
#[derive(Clone)]
pub struct PgCvrStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgCvrStore {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        PgCvrStore { pool }
    }

    async fn conn(
        &self,
    ) -> Result<diesel_async::pooled_connection::deadpool::Object<AsyncPgConnection>, StorageError>
    {
        self.pool
            .get()
            .await
            .map_err(|err| StorageError::Unexpected(format!("connection pool: {}", err)))
    }
}

/// Reassembles the aggregate from its four tables. Tombstoned clients and
/// queries stay in the maps; only live desires contribute to the
/// `desired_by` / `desired_query_ids` cross references.
fn assemble_cvr(
    group: &ClientGroupId,
    instance: &StoredInstance,
    clients: Vec<StoredClient>,
    queries: Vec<StoredQuery>,
    desires: Vec<StoredDesire>,
) -> Result<ClientViewRecord, StorageError> {
    let mut cvr = ClientViewRecord {
        id: group.clone(),
        version: instance.version()?,
        replica_version: instance.replica_version.clone(),
        last_active: instance.last_active,
        clients: Default::default(),
        queries: Default::default(),
    };
    for stored in clients {
        let record = stored.into_record()?;
        cvr.clients.insert(record.id.clone(), record);
    }
    for stored in queries {
        let record = stored.into_record()?;
        cvr.queries.insert(record.hash.clone(), record);
    }
    for stored in desires {
        let desire = stored.into_record()?;
        if desire.deleted {
            continue;
        }
        if let (Some(client), Some(query)) = (
            cvr.clients.get_mut(&desire.client_id),
            cvr.queries.get_mut(&desire.hash),
        ) {
            if !client.deleted && !query.deleted {
                client.desired_query_ids.insert(desire.hash.clone());
                query
                    .desired_by
                    .insert(desire.client_id.clone(), desire.patch_version);
            }
        }
    }
    Ok(cvr)
}

#[async_trait]
impl CvrStore for PgCvrStore {
    #[instrument(skip(self))]
    async fn load(
        &self,
        client_group: &ClientGroupId,
        owner: &str,
        last_connect: NaiveDateTime,
    ) -> Result<CvrSnapshot, StorageError> {
        let mut conn = self.conn().await?;
        let group = client_group.clone();
        let owner = owner.to_owned();
        let snapshot = conn
            .transaction::<_, PostgresError, _>(|conn| {
                async move {
                    let instance = match StoredInstance::by_group(&group, conn)
                        .await
                        .map_err(PostgresError::from)?
                    {
                        Some(instance) => {
                            claim_lease(instance, &group, &owner, last_connect, conn).await?
                        }
                        None => {
                            let instance = StoredInstance {
                                client_group_id: group.clone(),
                                version_state: String::new(),
                                version_minor: 0,
                                replica_version: None,
                                last_active: last_connect,
                                owner: owner.clone(),
                                granted_at: last_connect,
                            };
                            diesel::insert_into(cvr_instances::table)
                                .values(&instance)
                                .execute(conn)
                                .await
                                .map_err(PostgresError::from)?;
                            debug!(client_group = %group, "created cvr instance");
                            instance
                        }
                    };

                    let clients = StoredClient::by_group(&group, conn)
                        .await
                        .map_err(PostgresError::from)?;
                    let queries = StoredQuery::by_group(&group, conn)
                        .await
                        .map_err(PostgresError::from)?;
                    let desires = StoredDesire::by_group(&group, conn)
                        .await
                        .map_err(PostgresError::from)?;

                    let cvr = assemble_cvr(&group, &instance, clients, queries, desires)?;
                    Ok(CvrSnapshot {
                        cvr,
                        owner,
                        granted_at: instance.granted_at,
                    })
                }
                .scope_boxed()
            })
            .await?;
        Ok(snapshot)
    }

    #[instrument(skip_all, fields(client_group = %snapshot.cvr.id))]
    async fn flush(
        &self,
        snapshot: &CvrSnapshot,
        pending: PendingChanges,
        now: NaiveDateTime,
    ) -> Result<FlushStats, StorageError> {
        let mut conn = self.conn().await?;
        let group = snapshot.cvr.id.clone();
        let expected_version = snapshot.cvr.version.clone();
        let epoch = (snapshot.owner.clone(), snapshot.granted_at);

        let stats = conn
            .transaction::<_, PostgresError, _>(|conn| {
                async move {
                    let instance = StoredInstance::by_group(&group, conn)
                        .await
                        .map_err(PostgresError::from)?
                        .ok_or_else(|| {
                            StorageError::NotFound("CvrInstance".to_string(), group.clone())
                        })?;

                    if (instance.owner.as_str(), instance.granted_at) != (epoch.0.as_str(), epoch.1)
                    {
                        return Err(StorageError::Ownership {
                            owner: instance.owner,
                            granted_at: instance.granted_at,
                        }
                        .into());
                    }
                    let stored_version = instance.version()?;
                    if stored_version != expected_version {
                        return Err(StorageError::ConcurrentModification {
                            expected: expected_version.to_string(),
                            actual: stored_version.to_string(),
                        }
                        .into());
                    }

                    let stats = FlushStats {
                        clients: pending.clients.len(),
                        queries: pending.queries.len(),
                        desires: pending.desires.len(),
                        rows: pending.rows.len(),
                    };

                    upsert_clients(&group, &pending, conn).await?;
                    upsert_queries(&group, &pending, conn).await?;
                    upsert_desires(&group, &pending, conn).await?;
                    delete_rows(&group, &pending, conn).await?;
                    upsert_rows(&group, &pending, conn).await?;

                    let (version_state, version_minor) = orm::encode_version(&pending.version);
                    diesel::update(
                        cvr_instances::table.filter(cvr_instances::client_group_id.eq(&group)),
                    )
                    .set((
                        cvr_instances::version_state.eq(version_state),
                        cvr_instances::version_minor.eq(version_minor),
                        cvr_instances::replica_version.eq(&pending.replica_version),
                        cvr_instances::last_active.eq(now),
                    ))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;

                    if let Some(rows_version) = &pending.rows_version {
                        let (version_state, version_minor) = orm::encode_version(rows_version);
                        let row = StoredRowsVersion {
                            client_group_id: group.clone(),
                            version_state,
                            version_minor,
                        };
                        diesel::insert_into(cvr_rows_version::table)
                            .values(&row)
                            .on_conflict(cvr_rows_version::client_group_id)
                            .do_update()
                            .set((
                                cvr_rows_version::version_state
                                    .eq(excluded(cvr_rows_version::version_state)),
                                cvr_rows_version::version_minor
                                    .eq(excluded(cvr_rows_version::version_minor)),
                            ))
                            .execute(conn)
                            .await
                            .map_err(PostgresError::from)?;
                    }

                    debug!(?stats, "flushed cvr");
                    Ok(stats)
                }
                .scope_boxed()
            })
            .await?;
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn purge(&self, client_group: &ClientGroupId) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let group = client_group.clone();
        conn.transaction::<_, PostgresError, _>(|conn| {
            async move {
                diesel::delete(
                    cvr_rows_version::table.filter(cvr_rows_version::client_group_id.eq(&group)),
                )
                .execute(conn)
                .await
                .map_err(PostgresError::from)?;
                diesel::delete(cvr_rows::table.filter(cvr_rows::client_group_id.eq(&group)))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                diesel::delete(cvr_desires::table.filter(cvr_desires::client_group_id.eq(&group)))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                diesel::delete(cvr_queries::table.filter(cvr_queries::client_group_id.eq(&group)))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                diesel::delete(cvr_clients::table.filter(cvr_clients::client_group_id.eq(&group)))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                diesel::delete(
                    cvr_instances::table.filter(cvr_instances::client_group_id.eq(&group)),
                )
                .execute(conn)
                .await
                .map_err(PostgresError::from)?;
                debug!(client_group = %group, "purged cvr");
                Ok(())
            }
            .scope_boxed()
        })
        .await?;
        Ok(())
    }

    async fn load_rows(
        &self,
        client_group: &ClientGroupId,
        ids: &[RowId],
    ) -> Result<Vec<RowRecord>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let keys: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| serde_json::to_value(&id.row_key).expect("row keys are always serializable"))
            .collect();
        let wanted: HashSet<&RowId> = ids.iter().collect();

        let stored: Vec<StoredRow> = cvr_rows::table
            .filter(cvr_rows::client_group_id.eq(client_group))
            .filter(cvr_rows::row_key.eq_any(&keys))
            .select(StoredRow::as_select())
            .load::<StoredRow>(&mut conn)
            .await
            .map_err(PostgresError::from)?;

        let mut records = Vec::with_capacity(stored.len());
        for row in stored {
            let record = row.into_record()?;
            // The key filter alone can fan out across tables sharing key
            // shapes; keep only exact identity matches.
            if wanted.contains(&record.id) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn row_records(
        &self,
        client_group: &ClientGroupId,
    ) -> Result<RowRecordStream, StorageError> {
        let pool = self.pool.clone();
        let group = client_group.clone();
        let stream = try_stream! {
            let mut conn = pool
                .get()
                .await
                .map_err(|err| StorageError::Unexpected(format!("connection pool: {}", err)))?;
            let mut offset = 0i64;
            loop {
                let page: Vec<StoredRow> = cvr_rows::table
                    .filter(cvr_rows::client_group_id.eq(&group))
                    .order((
                        cvr_rows::schema_name,
                        cvr_rows::table_name,
                        cvr_rows::row_key,
                    ))
                    .limit(ROW_PAGE_SIZE)
                    .offset(offset)
                    .select(StoredRow::as_select())
                    .load::<StoredRow>(&mut conn)
                    .await
                    .map_err(|err| StorageError::from(PostgresError::from(err)))?;
                if page.is_empty() {
                    break;
                }
                offset += page.len() as i64;
                let mut records = Vec::with_capacity(page.len());
                for row in page {
                    records.push(row.into_record()?);
                }
                yield records;
            }
        };
        Ok(stream.boxed())
    }

    async fn catchup_config_patches(
        &self,
        client_group: &ClientGroupId,
        after: &CvrVersion,
        current: &CvrVersion,
    ) -> Result<ConfigPatchStream, StorageError> {
        let mut conn = self.conn().await?;
        let (a_state, a_minor) = orm::encode_version(after);
        let (c_state, c_minor) = orm::encode_version(current);

        let clients: Vec<StoredClient> = cvr_clients::table
            .filter(cvr_clients::client_group_id.eq(client_group))
            .filter(
                cvr_clients::patch_version_state.gt(a_state.clone()).or(
                    cvr_clients::patch_version_state
                        .eq(a_state.clone())
                        .and(cvr_clients::patch_version_minor.gt(a_minor)),
                ),
            )
            .filter(
                cvr_clients::patch_version_state.lt(c_state.clone()).or(
                    cvr_clients::patch_version_state
                        .eq(c_state.clone())
                        .and(cvr_clients::patch_version_minor.le(c_minor)),
                ),
            )
            .select(StoredClient::as_select())
            .load::<StoredClient>(&mut conn)
            .await
            .map_err(PostgresError::from)?;

        // Queries and desires need the full query set anyway (the desire put
        // patch carries the AST), so the window is applied in memory.
        let queries = StoredQuery::by_group(client_group, &mut conn)
            .await
            .map_err(PostgresError::from)?;
        let desires = StoredDesire::by_group(client_group, &mut conn)
            .await
            .map_err(PostgresError::from)?;

        let mut asts = std::collections::BTreeMap::new();
        let mut patches: Vec<PatchToVersion> = Vec::new();

        for stored in clients {
            let record = stored.into_record()?;
            let patch = if record.deleted {
                ConfigPatch::DelClient {
                    client_id: record.id,
                }
            } else {
                ConfigPatch::PutClient {
                    client_id: record.id,
                }
            };
            patches.push(PatchToVersion::config(record.patch_version, patch));
        }
        for stored in queries {
            let record = stored.into_record()?;
            asts.insert(record.hash.clone(), record.ast.clone());
            if record.internal {
                continue;
            }
            let Some(patch_version) = record.patch_version else {
                continue;
            };
            if patch_version <= *after || patch_version > *current {
                continue;
            }
            let patch = if record.deleted {
                ConfigPatch::DelQuery { hash: record.hash }
            } else {
                ConfigPatch::PutQuery {
                    hash: record.hash,
                    ast: record.ast,
                }
            };
            patches.push(PatchToVersion::config(patch_version, patch));
        }
        for stored in desires {
            let record = stored.into_record()?;
            if record.patch_version <= *after || record.patch_version > *current {
                continue;
            }
            let patch = if record.deleted {
                ConfigPatch::DelDesire {
                    client_id: record.client_id,
                    hash: record.hash,
                }
            } else {
                let Some(ast) = asts.get(&record.hash).cloned() else {
                    continue;
                };
                ConfigPatch::PutDesire {
                    client_id: record.client_id,
                    hash: record.hash,
                    ast,
                }
            };
            patches.push(PatchToVersion::config(record.patch_version, patch));
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
        let pool = self.pool.clone();
        let group = client_group.clone();
        let (a_state, a_minor) = orm::encode_version(after);
        let (c_state, c_minor) = orm::encode_version(current);
        let excluded_set: HashSet<QueryHash> = exclude_queries.iter().cloned().collect();

        let stream = try_stream! {
            let mut conn = pool
                .get()
                .await
                .map_err(|err| StorageError::Unexpected(format!("connection pool: {}", err)))?;
            let mut offset = 0i64;
            loop {
                let page: Vec<StoredRow> = cvr_rows::table
                    .filter(cvr_rows::client_group_id.eq(&group))
                    .filter(
                        cvr_rows::patch_version_state
                            .gt(a_state.clone())
                            .or(cvr_rows::patch_version_state
                                .eq(a_state.clone())
                                .and(cvr_rows::patch_version_minor.gt(a_minor))),
                    )
                    .filter(
                        cvr_rows::patch_version_state
                            .lt(c_state.clone())
                            .or(cvr_rows::patch_version_state
                                .eq(c_state.clone())
                                .and(cvr_rows::patch_version_minor.le(c_minor))),
                    )
                    .order((
                        cvr_rows::schema_name,
                        cvr_rows::table_name,
                        cvr_rows::row_key,
                    ))
                    .limit(ROW_PAGE_SIZE)
                    .offset(offset)
                    .select(StoredRow::as_select())
                    .load::<StoredRow>(&mut conn)
                    .await
                    .map_err(|err| StorageError::from(PostgresError::from(err)))?;
                if page.is_empty() {
                    break;
                }
                offset += page.len() as i64;
                let mut records = Vec::with_capacity(page.len());
                for row in page {
                    let record = row.into_record()?;
                    if live_only_in(&record, &excluded_set) {
                        continue;
                    }
                    records.push(record);
                }
                if !records.is_empty() {
                    yield records;
                }
            }
        };
        Ok(stream.boxed())
    }
}

async fn claim_lease(
    instance: StoredInstance,
    group: &ClientGroupId,
    owner: &str,
    last_connect: NaiveDateTime,
    conn: &mut AsyncPgConnection,
) -> Result<StoredInstance, PostgresError> {
    if instance.granted_at > last_connect
        || (instance.granted_at == last_connect && instance.owner != owner)
    {
        return Err(StorageError::Ownership {
            owner: instance.owner,
            granted_at: instance.granted_at,
        }
        .into());
    }
    if instance.granted_at == last_connect {
        // Same epoch, same owner: a re-load within one connection.
        return Ok(instance);
    }
    diesel::update(cvr_instances::table.filter(cvr_instances::client_group_id.eq(group)))
        .set((
            cvr_instances::owner.eq(owner),
            cvr_instances::granted_at.eq(last_connect),
        ))
        .execute(conn)
        .await
        .map_err(PostgresError::from)?;
    debug!(client_group = %group, %owner, "claimed cvr ownership");
    Ok(StoredInstance {
        owner: owner.to_owned(),
        granted_at: last_connect,
        ..instance
    })
}

/// True when the row is live and every reference belongs to the excluded
/// hydration set; such rows reach the client through the live path instead of
/// catch-up.
fn live_only_in(record: &RowRecord, exclude: &HashSet<QueryHash>) -> bool {
    match &record.ref_counts {
        None => false,
        Some(ref_counts) => {
            !exclude.is_empty() && ref_counts.keys().all(|hash| exclude.contains(hash))
        }
    }
}

async fn upsert_clients(
    group: &ClientGroupId,
    pending: &PendingChanges,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    if pending.clients.is_empty() {
        return Ok(());
    }
    let rows: Vec<StoredClient> = pending
        .clients
        .iter()
        .map(|record| StoredClient::from_record(group, record))
        .collect();
    diesel::insert_into(cvr_clients::table)
        .values(&rows)
        .on_conflict((cvr_clients::client_group_id, cvr_clients::client_id))
        .do_update()
        .set((
            cvr_clients::patch_version_state.eq(excluded(cvr_clients::patch_version_state)),
            cvr_clients::patch_version_minor.eq(excluded(cvr_clients::patch_version_minor)),
            cvr_clients::deleted.eq(excluded(cvr_clients::deleted)),
        ))
        .execute(conn)
        .await
        .map_err(PostgresError::from)?;
    Ok(())
}

async fn upsert_queries(
    group: &ClientGroupId,
    pending: &PendingChanges,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    if pending.queries.is_empty() {
        return Ok(());
    }
    let rows: Vec<StoredQuery> = pending
        .queries
        .iter()
        .map(|record| StoredQuery::from_record(group, record))
        .collect();
    diesel::insert_into(cvr_queries::table)
        .values(&rows)
        .on_conflict((cvr_queries::client_group_id, cvr_queries::query_hash))
        .do_update()
        .set((
            cvr_queries::client_ast.eq(excluded(cvr_queries::client_ast)),
            cvr_queries::transformation_hash.eq(excluded(cvr_queries::transformation_hash)),
            cvr_queries::transformation_version_state
                .eq(excluded(cvr_queries::transformation_version_state)),
            cvr_queries::transformation_version_minor
                .eq(excluded(cvr_queries::transformation_version_minor)),
            cvr_queries::patch_version_state.eq(excluded(cvr_queries::patch_version_state)),
            cvr_queries::patch_version_minor.eq(excluded(cvr_queries::patch_version_minor)),
            cvr_queries::internal.eq(excluded(cvr_queries::internal)),
            cvr_queries::deleted.eq(excluded(cvr_queries::deleted)),
        ))
        .execute(conn)
        .await
        .map_err(PostgresError::from)?;
    Ok(())
}

async fn upsert_desires(
    group: &ClientGroupId,
    pending: &PendingChanges,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    if pending.desires.is_empty() {
        return Ok(());
    }
    let rows: Vec<StoredDesire> = pending
        .desires
        .iter()
        .map(|record| StoredDesire::from_record(group, record))
        .collect();
    diesel::insert_into(cvr_desires::table)
        .values(&rows)
        .on_conflict((
            cvr_desires::client_group_id,
            cvr_desires::client_id,
            cvr_desires::query_hash,
        ))
        .do_update()
        .set((
            cvr_desires::patch_version_state.eq(excluded(cvr_desires::patch_version_state)),
            cvr_desires::patch_version_minor.eq(excluded(cvr_desires::patch_version_minor)),
            cvr_desires::deleted.eq(excluded(cvr_desires::deleted)),
        ))
        .execute(conn)
        .await
        .map_err(PostgresError::from)?;
    Ok(())
}

/// Hard deletes for renamed row keys; ordinary removals tombstone instead.
async fn delete_rows(
    group: &ClientGroupId,
    pending: &PendingChanges,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    for id in &pending.removed_rows {
        let key = serde_json::to_value(&id.row_key).expect("row keys are always serializable");
        diesel::delete(
            cvr_rows::table
                .filter(cvr_rows::client_group_id.eq(group))
                .filter(cvr_rows::schema_name.eq(&id.schema))
                .filter(cvr_rows::table_name.eq(&id.table))
                .filter(cvr_rows::row_key.eq(key)),
        )
        .execute(conn)
        .await
        .map_err(PostgresError::from)?;
    }
    Ok(())
}

async fn upsert_rows(
    group: &ClientGroupId,
    pending: &PendingChanges,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    if pending.rows.is_empty() {
        return Ok(());
    }
    let rows: Vec<StoredRow> = pending
        .rows
        .iter()
        .map(|record| StoredRow::from_record(group, record))
        .collect();
    diesel::insert_into(cvr_rows::table)
        .values(&rows)
        .on_conflict((
            cvr_rows::client_group_id,
            cvr_rows::schema_name,
            cvr_rows::table_name,
            cvr_rows::row_key,
        ))
        .do_update()
        .set((
            cvr_rows::row_version.eq(excluded(cvr_rows::row_version)),
            cvr_rows::patch_version_state.eq(excluded(cvr_rows::patch_version_state)),
            cvr_rows::patch_version_minor.eq(excluded(cvr_rows::patch_version_minor)),
            cvr_rows::ref_counts.eq(excluded(cvr_rows::ref_counts)),
        ))
        .execute(conn)
        .await
        .map_err(PostgresError::from)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::testing::run_against_db;
    use rowsync_core::models::{cvr::ClientRecord, version::StateVersion};

    fn ts(raw: &str) -> NaiveDateTime {
        raw.parse().unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a migrated database via DATABASE_URL"]
    async fn test_serial_db_load_creates_instance_at_min() {
        run_against_db(|pool| async move {
            let store = PgCvrStore::new(pool);

            let snapshot = CvrStore::load(
                &store,
                &"g1".to_string(),
                "task-a",
                ts("2024-05-13T10:00:00"),
            )
            .await
            .unwrap();

            assert_eq!(snapshot.cvr.version, CvrVersion::min());
            assert_eq!(snapshot.owner, "task-a");
        })
        .await;
    }

    #[tokio::test]
    #[ignore = "requires a migrated database via DATABASE_URL"]
    async fn test_serial_db_flush_round_trips() {
        run_against_db(|pool| async move {
            let store = PgCvrStore::new(pool);
            let group = "g1".to_string();
            let snapshot = CvrStore::load(&store, &group, "task-a", ts("2024-05-13T10:00:00"))
                .await
                .unwrap();

            let version = CvrVersion::new(StateVersion::from_sequence(1), 0);
            let mut client = ClientRecord::new(&"c1".to_string(), version.clone());
            client.desired_query_ids.insert("q1".to_string());
            let pending = PendingChanges {
                version: version.clone(),
                replica_version: Some("r1".to_string()),
                clients: vec![client],
                ..Default::default()
            };
            store
                .flush(&snapshot, pending, ts("2024-05-13T10:00:01"))
                .await
                .unwrap();

            let reloaded = CvrStore::load(&store, &group, "task-a", ts("2024-05-13T10:00:02"))
                .await
                .unwrap();
            assert_eq!(reloaded.cvr.version, version);
            assert_eq!(reloaded.cvr.replica_version, Some("r1".to_string()));
            assert!(reloaded.cvr.clients.contains_key("c1"));
        })
        .await;
    }

    #[tokio::test]
    #[ignore = "requires a migrated database via DATABASE_URL"]
    async fn test_serial_db_purge_resets_group() {
        run_against_db(|pool| async move {
            let store = PgCvrStore::new(pool);
            let group = "g1".to_string();
            let snapshot = CvrStore::load(&store, &group, "task-a", ts("2024-05-13T10:00:00"))
                .await
                .unwrap();
            let version = CvrVersion::new(StateVersion::from_sequence(1), 0);
            let pending = PendingChanges {
                version: version.clone(),
                clients: vec![ClientRecord::new(&"c1".to_string(), version)],
                ..Default::default()
            };
            store
                .flush(&snapshot, pending, ts("2024-05-13T10:00:01"))
                .await
                .unwrap();

            store.purge(&group).await.unwrap();

            let fresh = CvrStore::load(&store, &group, "task-b", ts("2024-05-13T10:00:02"))
                .await
                .unwrap();
            assert_eq!(fresh.cvr.version, CvrVersion::min());
            assert!(fresh.cvr.clients.is_empty());
        })
        .await;
    }

    #[tokio::test]
    #[ignore = "requires a migrated database via DATABASE_URL"]
    async fn test_serial_db_newer_lease_fences_old_owner() {
        run_against_db(|pool| async move {
            let store = PgCvrStore::new(pool);
            let group = "g1".to_string();
            let old = CvrStore::load(&store, &group, "task-a", ts("2024-05-13T10:00:00"))
                .await
                .unwrap();
            CvrStore::load(&store, &group, "task-b", ts("2024-05-13T10:00:05"))
                .await
                .unwrap();

            let res = store
                .flush(&old, PendingChanges::default(), ts("2024-05-13T10:00:06"))
                .await;

            assert!(matches!(res, Err(StorageError::Ownership { .. })));
        })
        .await;
    }
}
