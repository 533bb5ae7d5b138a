//! # model_storage
//!
//! In-memory, versioned entity-relationship store for a workspace model.
//!
//! This crate provides:
//!
//! - [`WorkspaceEntity`]: the contract every stored entity type satisfies.
//! - [`Snapshot`]: an immutable, cheaply clonable view of the model.
//! - [`Builder`]: a mutable transaction over a snapshot that records the
//!   net effect of its mutations in a compacted [`ChangeLog`]. A fork's
//!   log can be replayed onto another builder with [`Builder::add_diff`].
//! - [`ConnectionId`]: parent/child references between entity types.
//! - [`ExternalMappingKey`]: caller-defined side tables keyed by entity.
//! - [`EntityStorage`]: the read API shared by snapshots and builders.
//!
//! ## Usage
//!
//! ```rust
//! use serde::Serialize;
//! use model_storage::{Builder, ConnectionId, EntitySource, EntityStorage, WorkspaceEntity};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize)]
//! struct ModuleEntity {
//!     name: String,
//! }
//!
//! impl WorkspaceEntity for ModuleEntity {
//!     const TYPE_NAME: &'static str = "ModuleEntity";
//! }
//!
//! #[derive(Debug, Clone, PartialEq, Serialize)]
//! struct ContentRootEntity {
//!     url: String,
//! }
//!
//! impl WorkspaceEntity for ContentRootEntity {
//!     const TYPE_NAME: &'static str = "ContentRootEntity";
//! }
//!
//! const CONTENT_ROOTS: ConnectionId =
//!     ConnectionId::one_to_many::<ModuleEntity, ContentRootEntity>("contentRoots");
//!
//! let source = EntitySource::new("project.xml");
//! let mut builder = Builder::new();
//! let root = builder.add_entity(source.clone(), ContentRootEntity { url: "file:///src".into() });
//! let module = builder.add_entity_with(source, ModuleEntity { name: "core".into() }, |m| {
//!     m.set_children(CONTENT_ROOTS, [root]);
//! });
//!
//! let snapshot = builder.to_snapshot();
//! assert_eq!(snapshot.parent(CONTENT_ROOTS, root), Some(module.id()));
//! ```

pub mod builder;
pub mod change_log;
pub mod changes;
pub mod config;
mod consistency;
pub mod entity;
pub mod error;
pub mod external;
pub mod family;
mod indexes;
pub mod refs;
pub mod snapshot;
pub mod storage;

#[cfg(test)]
mod test_entities;

pub use builder::{Builder, EntityModifier};
pub use change_log::{ChangeEntitySource, ChangeEntry, ChangeKind, ChangeLog, ReplaceEntity};
pub use changes::{ChangeRecord, CollectedChanges, EntityChange, ParentRecord, ReferenceRecord, TypeChanges};
pub use config::{STRICT_ENV_VAR, StorageConfig};
pub use entity::{EntityData, EntityId, EntityRef, EntitySource, EntityTypeId, ErasedData, ErasedEntityData, SymbolicId, WorkspaceEntity};
pub use error::{ConsistencyError, StorageError};
pub use external::{ExternalMapping, ExternalMappingKey, MappingTable, MappingValue, MutableExternalMapping};
pub use family::{EntityFamily, ImmutableEntityFamily, MutableEntityFamily};
pub use refs::{ConnectionId, ConnectionKind};
pub use snapshot::{Snapshot, StorageQuery};
pub use storage::{EntityStorage, StorageParts};
