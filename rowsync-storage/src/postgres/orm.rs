use super::schema::{
    cvr_clients, cvr_desires, cvr_instances, cvr_queries, cvr_rows, cvr_rows_version,
};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rowsync_core::{
    models::{
        cvr::{ClientRecord, QueryRecord, RefCounts, RowId, RowRecord},
        version::{CvrVersion, StateVersion},
        ClientGroupId,
    },
    storage::{DesireRecord, StorageError},
};
use std::collections::BTreeMap;

/// Splits a CVR version into its two column values.
pub(crate) fn encode_version(version: &CvrVersion) -> (String, i64) {
    (
        version.state_version.to_string(),
        version.minor_version as i64,
    )
}

pub(crate) fn decode_version(state: &str, minor: i64) -> Result<CvrVersion, StorageError> {
    let state_version: StateVersion = state
        .parse()
        .map_err(|err| StorageError::Unexpected(format!("stored version corrupt: {}", err)))?;
    let minor_version = u32::try_from(minor)
        .map_err(|_| StorageError::Unexpected(format!("stored minor version corrupt: {minor}")))?;
    Ok(CvrVersion {
        state_version,
        minor_version,
    })
}

pub(crate) fn decode_version_opt(
    state: Option<&str>,
    minor: Option<i64>,
) -> Result<Option<CvrVersion>, StorageError> {
    match (state, minor) {
        (Some(state), Some(minor)) => Ok(Some(decode_version(state, minor)?)),
        (None, None) => Ok(None),
        _ => Err(StorageError::Unexpected(
            "stored version pair is half-null".to_string(),
        )),
    }
}

/// The instance row: CVR version plus the ownership lease.
#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = cvr_instances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StoredInstance {
    pub client_group_id: String,
    pub version_state: String,
    pub version_minor: i64,
    pub replica_version: Option<String>,
    pub last_active: NaiveDateTime,
    pub owner: String,
    pub granted_at: NaiveDateTime,
}

impl StoredInstance {
    pub async fn by_group(
        group: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Option<StoredInstance>> {
        cvr_instances::table
            .filter(cvr_instances::client_group_id.eq(group))
            .select(StoredInstance::as_select())
            .first::<StoredInstance>(conn)
            .await
            .optional()
    }

    pub fn version(&self) -> Result<CvrVersion, StorageError> {
        decode_version(&self.version_state, self.version_minor)
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = cvr_clients)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StoredClient {
    pub client_group_id: String,
    pub client_id: String,
    pub patch_version_state: String,
    pub patch_version_minor: i64,
    pub deleted: bool,
}

impl StoredClient {
    pub async fn by_group(
        group: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<StoredClient>> {
        cvr_clients::table
            .filter(cvr_clients::client_group_id.eq(group))
            .select(StoredClient::as_select())
            .load::<StoredClient>(conn)
            .await
    }

    pub fn from_record(group: &ClientGroupId, record: &ClientRecord) -> Self {
        let (patch_version_state, patch_version_minor) = encode_version(&record.patch_version);
        StoredClient {
            client_group_id: group.clone(),
            client_id: record.id.clone(),
            patch_version_state,
            patch_version_minor,
            deleted: record.deleted,
        }
    }

    /// Rebuilds the in-memory record; desired query ids are filled in from
    /// the desires table by the caller.
    pub fn into_record(self) -> Result<ClientRecord, StorageError> {
        Ok(ClientRecord {
            id: self.client_id,
            patch_version: decode_version(&self.patch_version_state, self.patch_version_minor)?,
            desired_query_ids: Default::default(),
            deleted: self.deleted,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = cvr_queries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StoredQuery {
    pub client_group_id: String,
    pub query_hash: String,
    pub client_ast: serde_json::Value,
    pub transformation_hash: Option<String>,
    pub transformation_version_state: Option<String>,
    pub transformation_version_minor: Option<i64>,
    pub patch_version_state: Option<String>,
    pub patch_version_minor: Option<i64>,
    pub internal: bool,
    pub deleted: bool,
}

impl StoredQuery {
    pub async fn by_group(
        group: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<StoredQuery>> {
        cvr_queries::table
            .filter(cvr_queries::client_group_id.eq(group))
            .select(StoredQuery::as_select())
            .load::<StoredQuery>(conn)
            .await
    }

    pub fn from_record(group: &ClientGroupId, record: &QueryRecord) -> Self {
        let (transformation_version_state, transformation_version_minor) = record
            .transformation_version
            .as_ref()
            .map(encode_version)
            .map(|(s, m)| (Some(s), Some(m)))
            .unwrap_or((None, None));
        let (patch_version_state, patch_version_minor) = record
            .patch_version
            .as_ref()
            .map(encode_version)
            .map(|(s, m)| (Some(s), Some(m)))
            .unwrap_or((None, None));
        StoredQuery {
            client_group_id: group.clone(),
            query_hash: record.hash.clone(),
            client_ast: serde_json::to_value(&record.ast)
                .expect("query asts are always serializable"),
            transformation_hash: record.transformation_hash.clone(),
            transformation_version_state,
            transformation_version_minor,
            patch_version_state,
            patch_version_minor,
            internal: record.internal,
            deleted: record.deleted,
        }
    }

    /// Rebuilds the in-memory record; `desired_by` is filled in from the
    /// desires table by the caller.
    pub fn into_record(self) -> Result<QueryRecord, StorageError> {
        let ast = serde_json::from_value(self.client_ast)
            .map_err(|err| StorageError::Unexpected(format!("stored ast corrupt: {}", err)))?;
        Ok(QueryRecord {
            hash: self.query_hash,
            ast,
            transformation_hash: self.transformation_hash,
            transformation_version: decode_version_opt(
                self.transformation_version_state.as_deref(),
                self.transformation_version_minor,
            )?,
            patch_version: decode_version_opt(
                self.patch_version_state.as_deref(),
                self.patch_version_minor,
            )?,
            desired_by: BTreeMap::new(),
            internal: self.internal,
            deleted: self.deleted,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = cvr_desires)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StoredDesire {
    pub client_group_id: String,
    pub client_id: String,
    pub query_hash: String,
    pub patch_version_state: String,
    pub patch_version_minor: i64,
    pub deleted: bool,
}

impl StoredDesire {
    pub async fn by_group(
        group: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<StoredDesire>> {
        cvr_desires::table
            .filter(cvr_desires::client_group_id.eq(group))
            .select(StoredDesire::as_select())
            .load::<StoredDesire>(conn)
            .await
    }

    pub fn from_record(group: &ClientGroupId, record: &DesireRecord) -> Self {
        let (patch_version_state, patch_version_minor) = encode_version(&record.patch_version);
        StoredDesire {
            client_group_id: group.clone(),
            client_id: record.client_id.clone(),
            query_hash: record.hash.clone(),
            patch_version_state,
            patch_version_minor,
            deleted: record.deleted,
        }
    }

    pub fn into_record(self) -> Result<DesireRecord, StorageError> {
        Ok(DesireRecord {
            client_id: self.client_id,
            hash: self.query_hash,
            patch_version: decode_version(&self.patch_version_state, self.patch_version_minor)?,
            deleted: self.deleted,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = cvr_rows)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StoredRow {
    pub client_group_id: String,
    pub schema_name: String,
    pub table_name: String,
    pub row_key: serde_json::Value,
    pub row_version: String,
    pub patch_version_state: String,
    pub patch_version_minor: i64,
    pub ref_counts: Option<serde_json::Value>,
}

impl StoredRow {
    pub fn from_record(group: &ClientGroupId, record: &RowRecord) -> Self {
        let (patch_version_state, patch_version_minor) = encode_version(&record.patch_version);
        StoredRow {
            client_group_id: group.clone(),
            schema_name: record.id.schema.clone(),
            table_name: record.id.table.clone(),
            row_key: serde_json::to_value(&record.id.row_key)
                .expect("row keys are always serializable"),
            row_version: record.row_version.clone(),
            patch_version_state,
            patch_version_minor,
            ref_counts: record
                .ref_counts
                .as_ref()
                .map(|rc| serde_json::to_value(rc).expect("ref counts are always serializable")),
        }
    }

    pub fn into_record(self) -> Result<RowRecord, StorageError> {
        let row_key = serde_json::from_value(self.row_key)
            .map_err(|err| StorageError::Unexpected(format!("stored row key corrupt: {}", err)))?;
        let ref_counts: Option<RefCounts> = self
            .ref_counts
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| {
                StorageError::Unexpected(format!("stored ref counts corrupt: {}", err))
            })?;
        Ok(RowRecord {
            id: RowId {
                schema: self.schema_name,
                table: self.table_name,
                row_key,
            },
            row_version: self.row_version,
            patch_version: decode_version(&self.patch_version_state, self.patch_version_minor)?,
            ref_counts,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = cvr_rows_version)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StoredRowsVersion {
    pub client_group_id: String,
    pub version_state: String,
    pub version_minor: i64,
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CvrVersion::default())]
    #[case(CvrVersion::new(StateVersion::from_sequence(7), 0))]
    #[case(CvrVersion::new(StateVersion::from_sequence(1295), 4))]
    fn test_version_column_round_trip(#[case] version: CvrVersion) {
        let (state, minor) = encode_version(&version);

        assert_eq!(decode_version(&state, minor).unwrap(), version);
    }

    #[test]
    fn test_half_null_version_pair_is_rejected() {
        assert!(decode_version_opt(Some("a1"), None).is_err());
        assert_eq!(decode_version_opt(None, None).unwrap(), None);
    }
}
