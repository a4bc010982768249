use crate::ident::h128_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

use super::QueryHash;

/// Minimal declarative query AST.
///
/// Clients register queries as data, not SQL. The shape carries just enough
/// structure for the transformation stage to derive an executed plan hash;
/// evaluation happens elsewhere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAst {
    pub table: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub where_clause: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<Ordering>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ordering {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl QueryAst {
    pub fn table(table: &str) -> Self {
        QueryAst {
            table: table.to_owned(),
            where_clause: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Canonicalizes the AST so that semantically equal queries hash equally.
    ///
    /// Conditions are sorted by field, operator and value rendering; ordering
    /// clauses keep their significance and stay untouched.
    pub fn normalize(&self) -> QueryAst {
        let mut normalized = self.clone();
        normalized
            .where_clause
            .sort_by(|a, b| {
                (&a.field, a.op, a.value.to_string()).cmp(&(&b.field, b.op, b.value.to_string()))
            });
        normalized
    }

    /// Stable identity of the query, derived from the normalized JSON form.
    pub fn query_hash(&self) -> QueryHash {
        let canonical = serde_json::to_vec(&self.normalize())
            .expect("query asts are always serializable");
        h128_hex(&canonical)
    }
}
