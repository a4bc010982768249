//! Wire-level poke frames.
//!
//! A poke is the transport of patches: a `start` frame naming the cookie
//! interval it advances, any number of `part` frames carrying patch ops, and
//! an `end` frame committing (or cancelling) the whole. All three share one
//! `poke_id`. Cookies are rendered CVR versions and are opaque to clients
//! beyond equality and the server-promised ordering.

use super::{ast::QueryAst, ClientId, QueryHash};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Canonical marker carried by apply errors caused by a cookie the consumer
/// does not hold; its presence makes the failure recoverable by reconnect.
pub const BASE_COOKIE_MISMATCH: &str = "unexpected base cookie";

/// Wire-level protocol violations. These clear the poke pipeline; all but
/// `UnexpectedLmid` are recoverable by reconnecting.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum ProtocolError {
    #[error("poke id mismatch: receiving {receiving}, got {got}")]
    PokeIdMismatch { receiving: String, got: String },
    #[error("cookie gap: poke base {base:?} does not extend {held:?}")]
    CookieGap { held: Option<String>, base: Option<String> },
    #[error("{BASE_COOKIE_MISMATCH}: {0}")]
    UnexpectedBaseCookie(String),
    #[error("unexpected lmid: client claims {claimed}, record has {recorded}")]
    UnexpectedLmid { claimed: u64, recorded: u64 },
    #[error("table not present in schema map: {0}")]
    UnknownTable(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<crate::ident::IdentError> for ProtocolError {
    fn from(value: crate::ident::IdentError) -> Self {
        use crate::ident::IdentError;
        match value {
            IdentError::UnknownTable(table) => ProtocolError::UnknownTable(table),
            IdentError::MissingKeyColumn { table, column } => {
                ProtocolError::Malformed(format!("row for {table} lacks key column {column}"))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    pub poke_id: String,
    /// Cookie the receiving client must currently hold; `None` for a poke
    /// from the beginning of time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_cookie: Option<String>,
    pub cookie: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_versions: Option<SchemaVersions>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    pub min_supported_version: u32,
    pub max_supported_version: u32,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients_patch: Vec<ClientPatchOp>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub desired_queries_patches: BTreeMap<ClientId, Vec<QueryPatchOp>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub got_queries_patch: Vec<QueryPatchOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows_patch: Vec<RowPatchOp>,
}

impl PokePart {
    pub fn new(poke_id: &str) -> Self {
        PokePart { poke_id: poke_id.to_owned(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.last_mutation_id_changes.is_empty()
            && self.clients_patch.is_empty()
            && self.desired_queries_patches.is_empty()
            && self.got_queries_patch.is_empty()
            && self.rows_patch.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueryPatchOp {
    Put { hash: QueryHash, ast: QueryAst },
    Del { hash: QueryHash },
    Clear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientPatchOp {
    Put { client_id: ClientId },
    Del { client_id: ClientId },
    Clear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RowPatchOp {
    /// Full row contents keyed by the client-visible identifier embedded in
    /// `value` under the table's key columns.
    Put {
        #[serde(rename = "tableName")]
        table_name: String,
        value: Value,
    },
    Update {
        #[serde(rename = "tableName")]
        table_name: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constrain: Option<Vec<String>>,
    },
    Del {
        #[serde(rename = "tableName")]
        table_name: String,
        id: String,
    },
    Clear,
}

/// A fully accumulated poke, as buffered on the client between `start` and
/// `end` frames and as produced by `merge_pokes`.
#[derive(Clone, Debug, PartialEq)]
pub struct Poke {
    pub poke_id: String,
    pub base_cookie: Option<String>,
    pub cookie: String,
    pub parts: Vec<PokePart>,
}

/// Messages flowing from the syncer to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DownstreamMessage {
    Connected { client_id: ClientId },
    PokeStart(PokeStart),
    PokePart(PokePart),
    PokeEnd(PokeEnd),
    Error { kind: String, message: String },
    Pong,
}

/// Messages flowing from clients to the syncer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpstreamMessage {
    PutDesiredQueries { queries: BTreeMap<QueryHash, QueryAst> },
    DelDesiredQueries { hashes: Vec<QueryHash> },
    ClearDesiredQueries,
    Ping,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_poke_part_wire_shape() {
        let mut part = PokePart::new("b10");
        part.rows_patch.push(RowPatchOp::Put {
            table_name: "issues".to_string(),
            value: json!({"id": "123", "title": "crash"}),
        });
        part.rows_patch
            .push(RowPatchOp::Del { table_name: "issues".to_string(), id: "e/issues/9".to_string() });
        part.last_mutation_id_changes
            .insert("c1".to_string(), 7);

        let encoded = serde_json::to_value(&part).unwrap();

        assert_eq!(
            encoded,
            json!({
                "pokeId": "b10",
                "lastMutationIdChanges": {"c1": 7},
                "rowsPatch": [
                    {"op": "put", "tableName": "issues", "value": {"id": "123", "title": "crash"}},
                    {"op": "del", "tableName": "issues", "id": "e/issues/9"},
                ],
            })
        );
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let end = PokeEnd { poke_id: "b10".to_string(), cancel: false };

        assert_eq!(serde_json::to_value(&end).unwrap(), serde_json::json!({"pokeId": "b10"}));
    }

    #[test]
    fn test_downstream_message_tagging() {
        let msg = DownstreamMessage::PokeStart(PokeStart {
            poke_id: "b10".to_string(),
            base_cookie: None,
            cookie: "b10".to_string(),
            schema_versions: None,
        });

        let encoded = serde_json::to_value(&msg).unwrap();

        assert_eq!(encoded["type"], "pokeStart");
        assert_eq!(encoded["pokeId"], "b10");
    }
}
