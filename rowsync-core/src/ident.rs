//! Client-visible row identifier derivation.
//!
//! Internally rows are identified by `RowId` (schema, table, composite key).
//! On the wire clients address rows by a flat string key derived from the
//! table's primary key: `e/<table>/<value>` when the key is a single column,
//! `e/<table>/<h128>` of the JSON array of key values (in declared key order)
//! when it is composite. The hash only needs to be stable, not secret, so the
//! first 128 bits of keccak-256 are used.

use crate::models::cvr::RowId;
use std::collections::HashMap;
use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

#[derive(Error, Debug, PartialEq)]
pub enum IdentError {
    #[error("table not present in schema map: {0}")]
    UnknownTable(String),
    #[error("row for table {table} is missing key column {column}")]
    MissingKeyColumn { table: String, column: String },
}

/// Maps each synced table to its primary key columns in declared order.
#[derive(Clone, Debug, Default)]
pub struct SchemaMap {
    tables: HashMap<String, Vec<String>>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, primary_key: &[&str]) -> Self {
        self.tables.insert(
            table.to_owned(),
            primary_key
                .iter()
                .map(|c| (*c).to_owned())
                .collect(),
        );
        self
    }

    pub fn primary_key(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(|cols| cols.as_slice())
    }
}

/// First 128 bits of keccak-256, hex encoded.
pub fn h128_hex(data: &[u8]) -> String {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut digest = [0u8; 32];
    hasher.finalize(&mut digest);
    hex::encode(&digest[..16])
}

/// Derives the client-visible key for a row.
pub fn client_row_key(schema: &SchemaMap, row: &RowId) -> Result<String, IdentError> {
    let key_columns = schema
        .primary_key(&row.table)
        .ok_or_else(|| IdentError::UnknownTable(row.table.clone()))?;

    let mut values = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        let value = row
            .row_key
            .get(column)
            .ok_or_else(|| IdentError::MissingKeyColumn {
                table: row.table.clone(),
                column: column.clone(),
            })?;
        values.push(value);
    }

    if let [value] = values.as_slice() {
        return Ok(format!("e/{}/{}", row.table, value.primitive_string()));
    }
    let encoded = serde_json::to_vec(&values).expect("key values are always serializable");
    Ok(format!("e/{}/{}", row.table, h128_hex(&encoded)))
}
