//! Poke assembly.
//!
//! Turns the patches produced by one CVR update into the wire frames that
//! advance a client from its base cookie to the new CVR version: one start
//! frame, row parts chunked to bound frame sizes, and an end frame. Internal
//! row identifiers are translated to client-visible keys through the schema
//! map on the way out.

use rowsync_core::{
    ident::{client_row_key, SchemaMap},
    models::{
        patch::{ConfigPatch, Patch, PatchToVersion, RowPatch},
        poke::{Poke, PokeEnd, PokePart, PokeStart, ProtocolError, QueryPatchOp, RowPatchOp},
        version::CvrVersion,
        ClientId,
    },
};
use std::collections::BTreeMap;
use tracing::trace;

/// Upper bound of row ops per poke part.
const MAX_PART_ROWS: usize = 2048;

pub struct PokeAssembler<'a> {
    schema: &'a SchemaMap,
}

impl<'a> PokeAssembler<'a> {
    pub fn new(schema: &'a SchemaMap) -> Self {
        PokeAssembler { schema }
    }

    /// Builds the poke advancing `base_cookie` to `cookie`.
    ///
    /// Patches at or before the base cookie are already held by the receiver
    /// and are dropped; this is what lets row puts pinned to old patch
    /// versions skip clients that saw them before reconnecting.
    pub fn assemble(
        &self,
        base_cookie: Option<&CvrVersion>,
        cookie: &CvrVersion,
        patches: &[PatchToVersion],
        last_mutation_id_changes: BTreeMap<ClientId, u64>,
    ) -> Result<Poke, ProtocolError> {
        let poke_id = cookie.to_string();
        let mut config_part = PokePart::new(&poke_id);
        config_part.last_mutation_id_changes = last_mutation_id_changes;
        let mut row_ops: Vec<RowPatchOp> = Vec::new();

        let mut relevant = 0usize;
        for entry in patches {
            if let Some(base) = base_cookie {
                if entry.to_version <= *base {
                    continue;
                }
            }
            relevant += 1;
            match &entry.patch {
                Patch::Config(config) => self.push_config(&mut config_part, config),
                Patch::Row(RowPatch::Put { id, contents, .. }) => {
                    // Put contents carry the key columns; clients re-derive
                    // the identifier themselves.
                    row_ops.push(RowPatchOp::Put {
                        table_name: id.table.clone(),
                        value: contents.clone(),
                    });
                }
                Patch::Row(RowPatch::Del { id }) => {
                    row_ops.push(RowPatchOp::Del {
                        table_name: id.table.clone(),
                        id: client_row_key(self.schema, id)?,
                    });
                }
            }
        }
        trace!(poke_id, relevant, rows = row_ops.len(), "assembled poke");

        let mut parts = Vec::new();
        if !config_part.is_empty() {
            parts.push(config_part);
        }
        for chunk in row_ops.chunks(MAX_PART_ROWS) {
            let mut part = PokePart::new(&poke_id);
            part.rows_patch = chunk.to_vec();
            parts.push(part);
        }

        Ok(Poke {
            poke_id,
            base_cookie: base_cookie.map(|v| v.to_string()),
            cookie: cookie.to_string(),
            parts,
        })
    }

    fn push_config(&self, part: &mut PokePart, patch: &ConfigPatch) {
        match patch {
            ConfigPatch::PutClient { client_id } => part.clients_patch.push(
                rowsync_core::models::poke::ClientPatchOp::Put { client_id: client_id.clone() },
            ),
            ConfigPatch::DelClient { client_id } => part.clients_patch.push(
                rowsync_core::models::poke::ClientPatchOp::Del { client_id: client_id.clone() },
            ),
            ConfigPatch::PutQuery { hash, ast } => part
                .got_queries_patch
                .push(QueryPatchOp::Put { hash: hash.clone(), ast: ast.clone() }),
            ConfigPatch::DelQuery { hash } => part
                .got_queries_patch
                .push(QueryPatchOp::Del { hash: hash.clone() }),
            ConfigPatch::PutDesire { client_id, hash, ast } => part
                .desired_queries_patches
                .entry(client_id.clone())
                .or_default()
                .push(QueryPatchOp::Put { hash: hash.clone(), ast: ast.clone() }),
            ConfigPatch::DelDesire { client_id, hash } => part
                .desired_queries_patches
                .entry(client_id.clone())
                .or_default()
                .push(QueryPatchOp::Del { hash: hash.clone() }),
        }
    }
}

/// Splits an assembled poke into its wire frames.
pub fn into_frames(poke: Poke) -> (PokeStart, Vec<PokePart>, PokeEnd) {
    let start = PokeStart {
        poke_id: poke.poke_id.clone(),
        base_cookie: poke.base_cookie,
        cookie: poke.cookie,
        schema_versions: None,
    };
    let end = PokeEnd { poke_id: poke.poke_id, cancel: false };
    (start, poke.parts, end)
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;
    use rowsync_core::models::{
        ast::QueryAst,
        cvr::{KeyValue, RowId},
        version::{CvrVersion, StateVersion},
    };
    use serde_json::json;

    fn schema() -> SchemaMap {
        SchemaMap::new().with_table("issues", &["id"])
    }

    fn version(seq: u64, minor: u32) -> CvrVersion {
        CvrVersion::new(StateVersion::from_sequence(seq), minor)
    }

    fn row_id(key: &str) -> RowId {
        RowId::new(
            "public",
            "issues",
            btreemap! { "id".to_string() => KeyValue::Text(key.to_string()) },
        )
    }

    fn sample_patches() -> Vec<PatchToVersion> {
        vec![
            PatchToVersion::config(
                version(1, 0),
                ConfigPatch::PutQuery { hash: "q1".to_string(), ast: QueryAst::table("issues") },
            ),
            PatchToVersion::row(
                version(1, 0),
                RowPatch::Put {
                    id: row_id("123"),
                    row_version: "01".to_string(),
                    contents: json!({"id": "123"}),
                },
            ),
            PatchToVersion::row(
                version(2, 0),
                RowPatch::Del { id: row_id("124") },
            ),
        ]
    }

    #[test]
    fn test_assembles_config_and_row_parts() {
        let schema = schema();
        let assembler = PokeAssembler::new(&schema);

        let poke = assembler
            .assemble(None, &version(2, 0), &sample_patches(), BTreeMap::new())
            .unwrap();

        assert_eq!(poke.poke_id, "a2");
        assert_eq!(poke.base_cookie, None);
        assert_eq!(poke.parts.len(), 2);
        assert_eq!(poke.parts[0].got_queries_patch.len(), 1);
        assert_eq!(poke.parts[1].rows_patch.len(), 2);
        assert!(matches!(
            &poke.parts[1].rows_patch[1],
            RowPatchOp::Del { id, .. } if id == "e/issues/124"
        ));
    }

    #[test]
    fn test_base_cookie_filters_old_patches() {
        let schema = schema();
        let assembler = PokeAssembler::new(&schema);

        let poke = assembler
            .assemble(Some(&version(1, 0)), &version(2, 0), &sample_patches(), BTreeMap::new())
            .unwrap();

        // Only the del at (2,0) survives the filter.
        assert_eq!(poke.parts.len(), 1);
        assert_eq!(poke.parts[0].rows_patch.len(), 1);
        assert_eq!(poke.base_cookie, Some("a1".to_string()));
    }

    #[test]
    fn test_large_row_sets_are_chunked() {
        let schema = schema();
        let assembler = PokeAssembler::new(&schema);
        let patches: Vec<PatchToVersion> = (0..5000)
            .map(|i| {
                PatchToVersion::row(
                    version(1, 0),
                    RowPatch::Put {
                        id: row_id(&i.to_string()),
                        row_version: "01".to_string(),
                        contents: json!({"id": i.to_string()}),
                    },
                )
            })
            .collect();

        let poke = assembler
            .assemble(None, &version(1, 0), &patches, BTreeMap::new())
            .unwrap();

        assert_eq!(poke.parts.len(), 3);
        assert!(poke.parts.iter().all(|p| p.rows_patch.len() <= 2048));
        let total: usize = poke.parts.iter().map(|p| p.rows_patch.len()).sum();
        assert_eq!(total, 5000);
    }

    #[test]
    fn test_unknown_table_is_a_protocol_error() {
        let schema = SchemaMap::new();
        let assembler = PokeAssembler::new(&schema);
        let patches = vec![PatchToVersion::row(version(1, 0), RowPatch::Del { id: row_id("1") })];

        let res = assembler.assemble(None, &version(1, 0), &patches, BTreeMap::new());

        assert_eq!(res, Err(ProtocolError::UnknownTable("issues".to_string())));
    }
}
