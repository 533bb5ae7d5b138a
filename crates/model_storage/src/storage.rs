//! Read API shared by snapshots and builders.

use crate::consistency;
use crate::entity::{EntityData, EntityId, EntityRef, EntitySource, EntityTypeId, ErasedData, SymbolicId, WorkspaceEntity};
use crate::error::ConsistencyError;
use crate::external::{ExternalMapping, ExternalMappingKey, MappingValue};
use crate::family::{EntityFamily, ErasedFamily, FamilyLookup};
use crate::indexes::StorageIndexes;
use crate::refs::{ConnectionId, RefsTable};

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// Borrowed internals of a storage. Only this crate can look inside.
#[derive(Clone, Copy)]
pub struct StorageParts<'a> {
    pub(crate) families: &'a dyn FamilyLookup,
    pub(crate) refs: &'a RefsTable,
    pub(crate) indexes: &'a StorageIndexes,
}

/// Queries available on both [`Snapshot`](crate::Snapshot) and
/// [`Builder`](crate::Builder).
pub trait EntityStorage: Sealed {
    #[doc(hidden)]
    fn parts(&self) -> StorageParts<'_>;

    /// Live entities of type `T`, in id order.
    fn entities<T: WorkspaceEntity>(&self) -> impl Iterator<Item = &EntityData<T>> {
        self.parts()
            .families
            .typed::<T>()
            .into_iter()
            .flat_map(EntityFamily::iter)
    }

    fn entity_count<T: WorkspaceEntity>(&self) -> usize {
        self.parts().families.typed::<T>().map_or(0, EntityFamily::len)
    }

    /// Entity types that have ever held an entity in this storage.
    fn entity_types(&self) -> Vec<EntityTypeId> {
        let mut types = self.parts().families.entity_types();
        types.sort_unstable();
        types
    }

    fn entity<T: WorkspaceEntity>(&self, handle: EntityRef<T>) -> Option<&EntityData<T>> {
        self.parts()
            .families
            .typed::<T>()
            .and_then(|family| family.get(handle.id().index))
    }

    fn contains(&self, id: impl Into<EntityId>) -> bool {
        self.parts().families.contains(id.into())
    }

    /// Type-erased data of any entity.
    fn entity_data(&self, id: impl Into<EntityId>) -> Option<ErasedData> {
        self.parts().families.erased_data(id.into())
    }

    /// Children of `parent` through `connection`, in insertion order.
    fn children(&self, connection: ConnectionId, parent: impl Into<EntityId>) -> &[EntityId] {
        self.parts().refs.children(connection, parent.into())
    }

    /// Typed children of `parent` through `connection`.
    ///
    /// # Panics
    ///
    /// Panics if `C` is not the child type of `connection`.
    fn children_of<C: WorkspaceEntity>(
        &self,
        connection: ConnectionId,
        parent: impl Into<EntityId>,
    ) -> Vec<EntityRef<C>> {
        self.children(connection, parent)
            .iter()
            .map(|&child| EntityRef::from_id(child))
            .collect()
    }

    fn parent(&self, connection: ConnectionId, child: impl Into<EntityId>) -> Option<EntityId> {
        self.parts().refs.parent(connection, child.into())
    }

    /// Ids of every entity whose source satisfies `filter`, in id order.
    fn entities_by_source(&self, filter: impl FnMut(&EntitySource) -> bool) -> Vec<EntityId> {
        self.parts().indexes.entities_by_source(filter)
    }

    /// Look an entity up by its symbolic name.
    fn resolve<T: WorkspaceEntity>(&self, name: &str) -> Option<&EntityData<T>> {
        let parts = self.parts();
        let id = parts.indexes.resolve_symbolic(&SymbolicId::of::<T>(name))?;
        parts.families.typed::<T>()?.get(id.index)
    }

    /// Read-only view of an external mapping. Missing mappings read as empty.
    fn external_mapping<V: MappingValue>(&self, key: ExternalMappingKey<V>) -> ExternalMapping<V> {
        ExternalMapping::from_shared(self.parts().indexes.mapping(key.name()), key.name())
    }

    /// Verify that references, indexes and mappings agree with the entity
    /// families.
    fn check_consistency(&self) -> Result<(), ConsistencyError> {
        consistency::check(self.parts())
    }

    fn is_empty(&self) -> bool {
        let families = self.parts().families;
        families
            .entity_types()
            .into_iter()
            .filter_map(|entity_type| families.family(entity_type))
            .all(|family| family.len() == 0)
    }
}
