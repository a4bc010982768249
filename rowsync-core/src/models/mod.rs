pub mod ast;
pub mod cvr;
pub mod patch;
pub mod poke;
pub mod version;

/// Identifies the cohort of clients sharing one client view record.
pub type ClientGroupId = String;
/// Identifies a single client (e.g. one browser tab) within a group.
pub type ClientId = String;
/// Stable hash of a normalized query AST.
pub type QueryHash = String;
/// Hash identifying the executed plan a query was transformed into.
pub type TransformationHash = String;
