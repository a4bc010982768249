use super::{
    ast::QueryAst,
    version::CvrVersion,
    ClientGroupId, ClientId, QueryHash, TransformationHash,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A primitive primary-key value.
///
/// Row keys are restricted to primitives so that row identities are totally
/// ordered and hashable; floats are deliberately excluded. The untagged serde
/// representation round-trips through jsonb unchanged.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl KeyValue {
    /// The canonical string form used in client-visible row identifiers.
    pub fn primitive_string(&self) -> String {
        match self {
            KeyValue::Bool(b) => b.to_string(),
            KeyValue::Int(i) => i.to_string(),
            KeyValue::Text(s) => s.clone(),
        }
    }
}

/// Logical identity of a row: schema, table and its composite primary key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub schema: String,
    pub table: String,
    /// Primary key columns in column-name order.
    pub row_key: BTreeMap<String, KeyValue>,
}

impl RowId {
    pub fn new(schema: &str, table: &str, row_key: BTreeMap<String, KeyValue>) -> Self {
        RowId { schema: schema.to_owned(), table: table.to_owned(), row_key }
    }
}

/// Per-query reference counts for one row. Absent map means tombstone.
pub type RefCounts = BTreeMap<QueryHash, i32>;

/// Bookkeeping for one row held (or formerly held) by the client group.
///
/// `ref_counts[q] = k` means query `q` currently retains `k` references to
/// the row; the row is live iff any count is positive. A tombstone keeps
/// `ref_counts = None` and the version at which the row became absent so
/// catch-up can replay the deletion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: RowId,
    pub row_version: String,
    pub patch_version: CvrVersion,
    pub ref_counts: Option<RefCounts>,
}

impl RowRecord {
    pub fn is_tombstone(&self) -> bool {
        self.ref_counts.is_none()
    }

    pub fn is_live(&self) -> bool {
        self.ref_counts
            .as_ref()
            .map(|rc| rc.values().any(|count| *count > 0))
            .unwrap_or(false)
    }
}

/// Merges refcount deltas into an existing count map.
///
/// A delta of zero asserts continued referencing without changing the count.
/// Entries that reach zero or below are dropped; an empty result collapses to
/// `None` (tombstone).
pub fn merge_ref_counts(existing: Option<&RefCounts>, deltas: &RefCounts) -> Option<RefCounts> {
    let mut merged = existing.cloned().unwrap_or_default();
    for (hash, delta) in deltas {
        let count = merged.entry(hash.clone()).or_insert(0);
        *count += delta;
        if *count <= 0 {
            merged.remove(hash);
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// One client known to the group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    /// CVR version at which the client became known (or was soft-deleted).
    pub patch_version: CvrVersion,
    pub desired_query_ids: BTreeSet<QueryHash>,
    pub deleted: bool,
}

impl ClientRecord {
    pub fn new(id: &ClientId, patch_version: CvrVersion) -> Self {
        ClientRecord {
            id: id.clone(),
            patch_version,
            desired_query_ids: BTreeSet::new(),
            deleted: false,
        }
    }
}

/// One query tracked by the group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub hash: QueryHash,
    pub ast: QueryAst,
    /// Set once the query has been hydrated ("got").
    pub transformation_hash: Option<TransformationHash>,
    pub transformation_version: Option<CvrVersion>,
    /// Version at which the query became visible to clients. Unset until the
    /// first hydration.
    pub patch_version: Option<CvrVersion>,
    /// Clients desiring this query, with the version each desire was added.
    pub desired_by: BTreeMap<ClientId, CvrVersion>,
    /// Internal queries are server-maintained and never surface to clients.
    pub internal: bool,
    pub deleted: bool,
}

impl QueryRecord {
    pub fn new(hash: &QueryHash, ast: QueryAst) -> Self {
        QueryRecord {
            hash: hash.clone(),
            ast,
            transformation_hash: None,
            transformation_version: None,
            patch_version: None,
            desired_by: BTreeMap::new(),
            internal: false,
            deleted: false,
        }
    }

    /// A query is desired while at least one non-deleted client wants it.
    pub fn is_desired(&self) -> bool {
        !self.desired_by.is_empty()
    }

    /// A query is got once a transformation hash has been recorded.
    pub fn is_got(&self) -> bool {
        self.transformation_hash.is_some()
    }
}

/// Aggregate snapshot of a client view record.
///
/// Row records are deliberately absent here; they are read lazily through the
/// store (`CvrStore::load_rows` and the catch-up streams) and never held in
/// the snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientViewRecord {
    pub id: ClientGroupId,
    pub version: CvrVersion,
    /// Replica version at first hydration; a mismatch forces a reset.
    pub replica_version: Option<String>,
    pub last_active: NaiveDateTime,
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
}

impl ClientViewRecord {
    /// A freshly created CVR at the minimum version.
    pub fn new(id: &ClientGroupId, last_active: NaiveDateTime) -> Self {
        ClientViewRecord {
            id: id.clone(),
            version: CvrVersion::min(),
            replica_version: None,
            last_active,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
        }
    }

    /// Checks the structural invariants that must hold after every flush.
    ///
    /// Used by tests and debug assertions; violations indicate updater bugs.
    pub fn check_invariants(&self) -> Result<(), String> {
        for client in self.clients.values().filter(|c| !c.deleted) {
            for hash in &client.desired_query_ids {
                let query = self
                    .queries
                    .get(hash)
                    .ok_or_else(|| format!("client {} desires unknown query {hash}", client.id))?;
                if !query.desired_by.contains_key(&client.id) {
                    return Err(format!(
                        "query {hash} does not list client {} as desiring",
                        client.id
                    ));
                }
            }
        }
        for query in self.queries.values() {
            for client_id in query.desired_by.keys() {
                let known = self
                    .clients
                    .get(client_id)
                    .map(|c| !c.deleted && c.desired_query_ids.contains(&query.hash))
                    .unwrap_or(false);
                if !known {
                    return Err(format!(
                        "query {} lists stale desiring client {client_id}",
                        query.hash
                    ));
                }
            }
            if let Some(patch_version) = &query.patch_version {
                if *patch_version > self.version {
                    return Err(format!(
                        "query {} patch version {patch_version} exceeds cvr version {}",
                        query.hash, self.version
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;

    fn row_id(key: i64) -> RowId {
        RowId::new("public", "issues", btreemap! { "id".to_string() => KeyValue::Int(key) })
    }

    #[test]
    fn test_row_liveness() {
        let live = RowRecord {
            id: row_id(1),
            row_version: "03".to_string(),
            patch_version: CvrVersion::min(),
            ref_counts: Some(btreemap! { "q1".to_string() => 1 }),
        };
        let tombstone = RowRecord { ref_counts: None, ..live.clone() };

        assert!(live.is_live());
        assert!(!live.is_tombstone());
        assert!(!tombstone.is_live());
        assert!(tombstone.is_tombstone());
    }

    #[test]
    fn test_merge_ref_counts_adds_and_removes() {
        let existing = btreemap! { "q1".to_string() => 1, "q2".to_string() => 2 };

        let merged = merge_ref_counts(
            Some(&existing),
            &btreemap! { "q1".to_string() => -1, "q2".to_string() => 0, "q3".to_string() => 1 },
        )
        .unwrap();

        assert_eq!(merged, btreemap! { "q2".to_string() => 2, "q3".to_string() => 1 });
    }

    #[test]
    fn test_merge_ref_counts_collapses_to_tombstone() {
        let existing = btreemap! { "q1".to_string() => 1 };

        let merged = merge_ref_counts(Some(&existing), &btreemap! { "q1".to_string() => -1 });

        assert_eq!(merged, None);
    }

    #[test]
    fn test_merge_ref_counts_zero_delta_keeps_reference() {
        let existing = btreemap! { "q1".to_string() => 2 };

        let merged = merge_ref_counts(Some(&existing), &btreemap! { "q1".to_string() => 0 });

        assert_eq!(merged, Some(existing));
    }

    #[test]
    fn test_invariants_catch_dangling_desire() {
        let now = "2024-01-01T00:00:00".parse().unwrap();
        let mut cvr = ClientViewRecord::new(&"g1".to_string(), now);
        let mut client = ClientRecord::new(&"c1".to_string(), CvrVersion::min());
        client
            .desired_query_ids
            .insert("missing".to_string());
        cvr.clients.insert(client.id.clone(), client);

        assert!(cvr.check_invariants().is_err());
    }
}
