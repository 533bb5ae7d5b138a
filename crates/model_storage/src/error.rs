//! Storage error types.
//!
//! Misuse of the API (stale handles, removed ids, wrong families) panics.
//! These types cover the checks a caller can run and recover from.

use crate::entity::{EntityId, SymbolicId};

/// A broken internal invariant found by
/// [`check_consistency`](crate::EntityStorage::check_consistency).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyError {
    /// A parent lists a child that does not exist.
    #[error("'{connection}': {parent} lists missing child {child}")]
    DanglingChild {
        connection: &'static str,
        parent: EntityId,
        child: EntityId,
    },

    /// A child points at a parent that does not exist.
    #[error("'{connection}': {child} points at missing parent {parent}")]
    DanglingParent {
        connection: &'static str,
        child: EntityId,
        parent: EntityId,
    },

    /// An entity of the wrong type is linked through a connection.
    #[error("'{connection}': {id} has the wrong entity type")]
    WrongEntityType { connection: &'static str, id: EntityId },

    /// The child list and the parent pointer disagree.
    #[error("'{connection}': {parent} and {child} do not reference each other")]
    BrokenBackReference {
        connection: &'static str,
        parent: EntityId,
        child: EntityId,
    },

    /// The source index does not match the entity's source.
    #[error("source index is stale for {0}")]
    SourceIndexMismatch(EntityId),

    /// The symbolic-id index does not match the entity's fields.
    #[error("symbolic id {} of {} is not indexed correctly", .0.name, .1)]
    SymbolicIndexMismatch(SymbolicId, EntityId),

    /// An external mapping holds a value for a removed entity.
    #[error("external mapping '{mapping}' references missing {id}")]
    DanglingMapping { mapping: &'static str, id: EntityId },
}

/// Errors returned by fallible storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("consistency check failed: {0}")]
    Consistency(#[from] ConsistencyError),

    /// Failed to serialise entity data for export.
    #[error("failed to serialise entity data: {0}")]
    Serialize(#[from] serde_json::Error),
}
