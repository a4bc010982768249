//! Replica-facing collaborators.
//!
//! The CVR only records which rows a group holds at which version; contents
//! and authoritative last-mutation-ids live in the replica maintained by the
//! replication ingester. This module implements the two lookup traits the
//! syncer consumes against that database.

use async_trait::async_trait;
use diesel::sql_types::{BigInt, Text};
use diesel_async::{pooled_connection::deadpool::Pool, AsyncPgConnection, RunQueryDsl};
use rowsync_core::{
    models::{cvr::RowId, ClientGroupId, ClientId},
    storage::StorageError,
};
use serde_json::Value;
use std::sync::Arc;

use crate::client::{MutationLog, RowSource};

/// Both collaborator lookups against the replica database.
#[derive(Clone)]
pub struct PgReplica {
    pool: Pool<AsyncPgConnection>,
}

impl PgReplica {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        PgReplica { pool }
    }

    pub fn into_collaborators(self) -> (Arc<dyn MutationLog>, Arc<dyn RowSource>) {
        let shared = Arc::new(self);
        (shared.clone(), shared)
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

#[derive(diesel::QueryableByName)]
struct LmidRow {
    #[diesel(sql_type = BigInt)]
    last_mutation_id: i64,
}

#[derive(diesel::QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    row: String,
}

#[async_trait]
impl MutationLog for PgReplica {
    /// Reads the ingester-maintained `replication_clients` table.
    async fn last_mutation_id(
        &self,
        client_group: &ClientGroupId,
        client: &ClientId,
    ) -> Result<Option<u64>, StorageError> {
        let mut conn = self.conn().await?;
        let rows: Vec<LmidRow> = diesel::sql_query(
            "SELECT last_mutation_id FROM replication_clients \
             WHERE client_group_id = $1 AND client_id = $2",
        )
        .bind::<Text, _>(client_group)
        .bind::<Text, _>(client)
        .load(&mut conn)
        .await
        .map_err(|err| StorageError::Unexpected(format!("lmid lookup: {}", err)))?;
        Ok(rows
            .get(0)
            .map(|row| row.last_mutation_id as u64))
    }
}

#[async_trait]
impl RowSource for PgReplica {
    /// Fetches current contents as json, one query per row. Hydration volume
    /// flows through the IVM pipeline, not here; this path only serves
    /// catch-up, which is small by construction.
    async fn fetch(&self, ids: &[RowId]) -> Result<Vec<(RowId, String, Value)>, StorageError> {
        let mut conn = self.conn().await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let mut query = format!(
                "SELECT row_to_json(t.*)::text AS row FROM {}.{} t WHERE ",
                quote_ident(&id.schema),
                quote_ident(&id.table)
            );
            let mut binds: Vec<String> = Vec::new();
            for (i, (column, value)) in id.row_key.iter().enumerate() {
                if i > 0 {
                    query.push_str(" AND ");
                }
                query.push_str(&format!("{}::text = ${}", quote_ident(column), i + 1));
                binds.push(value.primitive_string());
            }
            let mut prepared = diesel::sql_query(query).into_boxed();
            for bind in binds {
                prepared = prepared.bind::<Text, _>(bind);
            }
            let rows: Vec<JsonRow> = prepared
                .load(&mut conn)
                .await
                .map_err(|err| StorageError::Unexpected(format!("row fetch: {}", err)))?;
            if let Some(found) = rows.get(0) {
                let contents: Value = serde_json::from_str(&found.row).map_err(|err| {
                    StorageError::Unexpected(format!("replica row not json: {}", err))
                })?;
                let row_version = contents
                    .get("_version")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                out.push((id.clone(), row_version, contents));
            }
        }
        Ok(out)
    }
}

fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}
