use super::{
    ast::QueryAst,
    cvr::RowId,
    version::CvrVersion,
    ClientId, QueryHash,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Externally visible effect of a CVR edit, pinned to the version at which it
/// became (or becomes) visible.
///
/// The `to_version` may be older than the version of the flush that produced
/// the patch: a row that was already present at an earlier version keeps its
/// original patch version, which is what keeps reconnect replay minimal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchToVersion {
    pub to_version: CvrVersion,
    pub patch: Patch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Patch {
    Config(ConfigPatch),
    Row(RowPatch),
}

/// Configuration change: clients joining or leaving, queries appearing,
/// disappearing, or changing desire state. Each variant carries exactly the
/// fields the change needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConfigPatch {
    PutClient { client_id: ClientId },
    DelClient { client_id: ClientId },
    PutQuery { hash: QueryHash, ast: QueryAst },
    DelQuery { hash: QueryHash },
    PutDesire { client_id: ClientId, hash: QueryHash, ast: QueryAst },
    DelDesire { client_id: ClientId, hash: QueryHash },
}

/// Row-level change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RowPatch {
    Put { id: RowId, row_version: String, contents: Value },
    Del { id: RowId },
}

impl PatchToVersion {
    pub fn config(to_version: CvrVersion, patch: ConfigPatch) -> Self {
        PatchToVersion { to_version, patch: Patch::Config(patch) }
    }

    pub fn row(to_version: CvrVersion, patch: RowPatch) -> Self {
        PatchToVersion { to_version, patch: Patch::Row(patch) }
    }
}
