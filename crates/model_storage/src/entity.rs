//! Entity identity, provenance, and the schema contract for entity types.
//!
//! Every record stored in the workspace model implements [`WorkspaceEntity`].
//! The storage core is schema-agnostic: it only needs the type name (to key
//! the per-type families) and the reference-field classification declared by
//! [`ConnectionId`](crate::refs::ConnectionId).
//!
//! [`EntityTypeId`] is an FNV-1a hash of `TYPE_NAME`, stable across runs,
//! so it can be written into exported change records.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};
use serde::Serialize;

/// Family key of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityTypeId(pub u64);

impl EntityTypeId {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    /// Hash a `TYPE_NAME`. Usable in `const` connection declarations.
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = Self::OFFSET;
        let mut at = 0;
        while at < bytes.len() {
            hash = (hash ^ bytes[at] as u64).wrapping_mul(Self::PRIME);
            at += 1;
        }
        Self(hash)
    }

    #[must_use]
    pub const fn of<T: WorkspaceEntity>() -> Self {
        Self::from_name(T::TYPE_NAME)
    }
}

impl fmt::Display for EntityTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies one entity: the family it lives in plus its slot index.
///
/// Slot indices are allocated monotonically per family and are never reused
/// while the family lives, so an id removed in one epoch cannot come back
/// with different data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityId {
    /// The family (entity type) this entity belongs to.
    pub entity_type: EntityTypeId,
    /// Slot index inside the family.
    pub index: u32,
}

impl EntityId {
    #[must_use]
    pub const fn new(entity_type: EntityTypeId, index: u32) -> Self {
        Self { entity_type, index }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}:{})", self.entity_type, self.index)
    }
}

/// Provenance tag attached to every entity.
///
/// The store never interprets the value; it only compares and indexes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntitySource(String);

impl EntitySource {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A name that uniquely identifies an entity among all entities of its type.
///
/// Entities that return a [`WorkspaceEntity::symbolic_name`] can be looked up
/// with [`EntityStorage::resolve`](crate::storage::EntityStorage::resolve).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SymbolicId {
    pub entity_type: EntityTypeId,
    pub name: String,
}

impl SymbolicId {
    #[must_use]
    pub fn of<T: WorkspaceEntity>(name: impl Into<String>) -> Self {
        Self {
            entity_type: EntityTypeId::of::<T>(),
            name: name.into(),
        }
    }
}

/// The schema contract every stored entity type satisfies.
///
/// # Examples
///
/// ```rust
/// use serde::Serialize;
/// use model_storage::WorkspaceEntity;
///
/// #[derive(Debug, Clone, PartialEq, Serialize)]
/// struct ModuleEntity {
///     name: String,
/// }
///
/// impl WorkspaceEntity for ModuleEntity {
///     const TYPE_NAME: &'static str = "ModuleEntity";
///
///     fn symbolic_name(&self) -> Option<String> {
///         Some(self.name.clone())
///     }
/// }
/// ```
pub trait WorkspaceEntity: Clone + fmt::Debug + PartialEq + Serialize + Send + Sync + 'static {
    /// A human-readable, process-independent name for this entity type.
    const TYPE_NAME: &'static str;

    /// Unique name of this entity among entities of the same type, if the
    /// type has one.
    fn symbolic_name(&self) -> Option<String> {
        None
    }
}

/// The payload record stored for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityData<T> {
    pub(crate) id: EntityId,
    /// Provenance tag of the entity.
    pub entity_source: EntitySource,
    /// User fields declared by the entity type.
    pub fields: T,
}

impl<T: WorkspaceEntity> EntityData<T> {
    #[must_use]
    pub fn new(id: EntityId, entity_source: EntitySource, fields: T) -> Self {
        assert_eq!(
            id.entity_type,
            EntityTypeId::of::<T>(),
            "{id} does not belong to the {} family",
            T::TYPE_NAME
        );
        Self {
            id,
            entity_source,
            fields,
        }
    }

    #[must_use]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Typed handle to this entity.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef<T> {
        EntityRef::from_id(self.id)
    }
}

/// Object-safe view of an [`EntityData`] of any type.
///
/// Change entries and type-erased lookups carry entity data as [`ErasedData`];
/// use [`typed`](trait.ErasedEntityData.html#method.typed) to get the
/// concrete record back.
pub trait ErasedEntityData: DowncastSync + fmt::Debug {
    fn id(&self) -> EntityId;
    fn type_name(&self) -> &'static str;
    fn entity_source(&self) -> &EntitySource;
    fn symbolic_id(&self) -> Option<SymbolicId>;
    /// Returns `true` when `other` is the same type and carries equal fields
    /// and source.
    fn same_as(&self, other: &(dyn ErasedEntityData + 'static)) -> bool;
    /// Serialise the record to a JSON value for change export.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl_downcast!(sync ErasedEntityData);

impl dyn ErasedEntityData {
    /// Downcast to the concrete record for entity type `T`.
    #[must_use]
    pub fn typed<T: WorkspaceEntity>(&self) -> Option<&EntityData<T>> {
        self.downcast_ref::<EntityData<T>>()
    }
}

/// Shared, type-erased entity data.
pub type ErasedData = Arc<dyn ErasedEntityData>;

impl<T: WorkspaceEntity> ErasedEntityData for EntityData<T> {
    fn id(&self) -> EntityId {
        self.id
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn entity_source(&self) -> &EntitySource {
        &self.entity_source
    }

    fn symbolic_id(&self) -> Option<SymbolicId> {
        self.fields.symbolic_name().map(SymbolicId::of::<T>)
    }

    fn same_as(&self, other: &(dyn ErasedEntityData + 'static)) -> bool {
        other.typed::<T>().is_some_and(|other| other == self)
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A typed handle to an entity.
///
/// Handles stay meaningful across forks: a handle obtained from a builder
/// resolves in every snapshot or builder derived from it, as long as the
/// entity has not been removed there.
pub struct EntityRef<T> {
    id: EntityId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: WorkspaceEntity> EntityRef<T> {
    /// Build a handle from a raw id.
    ///
    /// # Panics
    ///
    /// Panics if `id` belongs to a different entity type.
    #[must_use]
    pub fn from_id(id: EntityId) -> Self {
        assert_eq!(
            id.entity_type,
            EntityTypeId::of::<T>(),
            "{id} is not a {} handle",
            T::TYPE_NAME
        );
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Resolve the handle against any storage.
    #[must_use]
    pub fn resolve<S: crate::storage::EntityStorage>(self, storage: &S) -> Option<&EntityData<T>> {
        storage.entity(self)
    }
}

impl<T> EntityRef<T> {
    #[must_use]
    pub const fn id(self) -> EntityId {
        self.id
    }
}

impl<T> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EntityRef<T> {}

impl<T> PartialEq for EntityRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for EntityRef<T> {}

impl<T> std::hash::Hash for EntityRef<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({})", self.id)
    }
}

impl<T> From<EntityRef<T>> for EntityId {
    fn from(entity: EntityRef<T>) -> Self {
        entity.id
    }
}
