//! Mutable transaction over a base snapshot.
//!
//! A [`Builder`] starts from a [`Snapshot`] and shares all of its storage.
//! Mutations copy only the families, connection tables, indexes and entity
//! payloads they touch, and fold into the builder's [`ChangeLog`].
//!
//! ```rust
//! use serde::Serialize;
//! use model_storage::{Builder, ChangeKind, EntitySource, EntityStorage, WorkspaceEntity};
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
//! let mut builder = Builder::new();
//! let module = builder.add_entity(EntitySource::new("disk"), ModuleEntity { name: "core".into() });
//! builder.modify_entity(module, |m| m.name = "core-impl".into());
//!
//! assert_eq!(builder.change_log().len(), 1);
//! assert_eq!(builder.change_log().get(module).map(|e| e.kind()), Some(ChangeKind::Added));
//!
//! let snapshot = builder.to_snapshot();
//! assert_eq!(snapshot.entity(module).map(|m| m.fields.name.as_str()), Some("core-impl"));
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};

use indexmap::IndexMap;
use tracing::{debug, error, trace, warn};

use crate::change_log::{ChangeLog, Modification};
use crate::config::StorageConfig;
use crate::entity::{
    EntityData, EntityId, EntityRef, EntitySource, EntityTypeId, ErasedData, ErasedEntityData, SymbolicId,
    WorkspaceEntity,
};
use crate::external::{ExternalMappingKey, MappingValue, MutableExternalMapping};
use crate::family::{ErasedFamily, ErasedMutableFamily, MutableEntitiesBarrel};
use crate::indexes::StorageIndexes;
use crate::refs::{ConnectionId, ConnectionKind, EntityReferences, RefsTable};
use crate::snapshot::Snapshot;
use crate::storage::{EntityStorage, Sealed, StorageParts};

mod diff;

/// A pending reference update requested from inside `modify_entity`.
#[derive(Debug)]
enum RefOp {
    Children {
        connection: ConnectionId,
        children: Vec<EntityId>,
    },
    Parent {
        connection: ConnectionId,
        parent: Option<EntityId>,
    },
}

/// Mutable access to one entity's fields and references.
///
/// Field writes go straight to the entity's private copy. Reference updates
/// are applied after the closure passed to
/// [`Builder::modify_entity`] returns.
pub struct EntityModifier<'a, T> {
    id: EntityId,
    fields: &'a mut T,
    ref_ops: Vec<RefOp>,
}

impl<'a, T: WorkspaceEntity> EntityModifier<'a, T> {
    fn new(id: EntityId, fields: &'a mut T) -> Self {
        Self {
            id,
            fields,
            ref_ops: Vec::new(),
        }
    }

    /// Handle of the entity being modified.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef<T> {
        EntityRef::from_id(self.id)
    }

    fn assert_parent_side<C: WorkspaceEntity>(&self, connection: ConnectionId) {
        assert!(
            connection.parent_type() == EntityTypeId::of::<T>()
                && connection.child_type() == EntityTypeId::of::<C>(),
            "connection `{}` does not link {} to {}",
            connection.name(),
            T::TYPE_NAME,
            C::TYPE_NAME
        );
    }

    /// Replace the children of this entity through a one-to-many connection.
    /// Children keep the given order; duplicates are dropped.
    ///
    /// # Panics
    ///
    /// Panics if `connection` is not a one-to-many connection from `T` to `C`.
    pub fn set_children<C: WorkspaceEntity>(
        &mut self,
        connection: ConnectionId,
        children: impl IntoIterator<Item = EntityRef<C>>,
    ) -> &mut Self {
        self.assert_parent_side::<C>(connection);
        assert_eq!(
            connection.kind(),
            ConnectionKind::OneToMany,
            "use set_child for one-to-one connection `{}`",
            connection.name()
        );
        let mut ids: Vec<EntityId> = Vec::new();
        for child in children {
            if !ids.contains(&child.id()) {
                ids.push(child.id());
            }
        }
        self.ref_ops.push(RefOp::Children {
            connection,
            children: ids,
        });
        self
    }

    /// Set or clear the single child of this entity through a one-to-one
    /// connection.
    ///
    /// # Panics
    ///
    /// Panics if `connection` is not a one-to-one connection from `T` to `C`.
    pub fn set_child<C: WorkspaceEntity>(
        &mut self,
        connection: ConnectionId,
        child: Option<EntityRef<C>>,
    ) -> &mut Self {
        self.assert_parent_side::<C>(connection);
        assert_eq!(
            connection.kind(),
            ConnectionKind::OneToOne,
            "use set_children for one-to-many connection `{}`",
            connection.name()
        );
        self.ref_ops.push(RefOp::Children {
            connection,
            children: child.map(EntityRef::id).into_iter().collect(),
        });
        self
    }

    /// Attach this entity to `parent` through `connection`, or detach it.
    /// On a one-to-many connection the entity is appended to the parent's
    /// children.
    ///
    /// # Panics
    ///
    /// Panics if `connection` does not link `P` to `T`.
    pub fn set_parent<P: WorkspaceEntity>(
        &mut self,
        connection: ConnectionId,
        parent: Option<EntityRef<P>>,
    ) -> &mut Self {
        assert!(
            connection.parent_type() == EntityTypeId::of::<P>()
                && connection.child_type() == EntityTypeId::of::<T>(),
            "connection `{}` does not link {} to {}",
            connection.name(),
            P::TYPE_NAME,
            T::TYPE_NAME
        );
        self.ref_ops.push(RefOp::Parent {
            connection,
            parent: parent.map(EntityRef::id),
        });
        self
    }
}

impl<T> Deref for EntityModifier<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.fields
    }
}

impl<T> DerefMut for EntityModifier<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.fields
    }
}

/// References of other entities captured before a mutation touched them.
type TouchedReferences = IndexMap<EntityId, EntityReferences>;

fn capture_references(
    refs: &RefsTable,
    touched: &mut TouchedReferences,
    candidates: impl IntoIterator<Item = EntityId>,
    owner: EntityId,
) {
    for candidate in candidates {
        if candidate != owner {
            touched
                .entry(candidate)
                .or_insert_with(|| refs.references_of(candidate));
        }
    }
}

/// Mutable workspace model.
pub struct Builder {
    original: Snapshot,
    barrel: MutableEntitiesBarrel,
    refs: RefsTable,
    indexes: StorageIndexes,
    change_log: ChangeLog,
    config: StorageConfig,
}

impl Builder {
    /// An empty builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StorageConfig) -> Self {
        let mut builder = Self::from_snapshot(&Snapshot::empty());
        builder.config = config;
        builder
    }

    /// A builder on top of `snapshot`. Costs one reference-count bump per
    /// family and connection.
    #[must_use]
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            original: snapshot.clone(),
            barrel: snapshot.barrel().to_mutable(),
            refs: snapshot.refs().clone(),
            indexes: snapshot.indexes().clone(),
            change_log: ChangeLog::default(),
            config: StorageConfig::default(),
        }
    }

    /// Fork `other`: the new builder starts from `other`'s current state
    /// with an empty change log and the same configuration. Later writes on
    /// either builder are invisible to the other.
    #[must_use]
    pub fn from_builder(other: &Builder) -> Self {
        debug!(
            modifications = other.change_log.modification_count(),
            "forking builder"
        );
        let mut builder = Self::from_snapshot(&other.to_snapshot());
        builder.config = other.config;
        builder
    }

    #[must_use]
    pub fn config(&self) -> StorageConfig {
        self.config
    }

    /// The snapshot the change log is relative to.
    #[must_use]
    pub fn original(&self) -> &Snapshot {
        &self.original
    }

    /// Freeze the current state. The builder stays usable, and later writes
    /// do not affect the returned snapshot.
    #[must_use]
    pub fn to_snapshot(&self) -> Snapshot {
        debug!(pending = self.change_log.len(), "freezing builder");
        Snapshot::new(
            self.barrel.to_immutable(),
            self.refs.clone(),
            self.indexes.clone(),
        )
    }

    #[must_use]
    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    /// Discard all pending change entries. The current state becomes the new
    /// base for the next change log epoch.
    pub fn clear_change_log(&mut self) {
        debug!(discarded = self.change_log.len(), "clearing change log");
        self.change_log.clear();
        self.original = self.to_snapshot();
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.change_log.is_empty()
    }

    /// Number of mutations applied since this builder was created.
    #[must_use]
    pub fn modification_count(&self) -> u64 {
        self.change_log.modification_count()
    }

    /// Add an entity and return its handle.
    ///
    /// If another entity of the same type already uses the new entity's
    /// symbolic name, that entity is removed.
    pub fn add_entity<T: WorkspaceEntity>(&mut self, entity_source: EntitySource, fields: T) -> EntityRef<T> {
        let handle = self.insert_entity(entity_source, fields);
        self.finish_mutation();
        handle
    }

    /// Add an entity and set up its references in one step.
    pub fn add_entity_with<T: WorkspaceEntity>(
        &mut self,
        entity_source: EntitySource,
        fields: T,
        init: impl FnOnce(&mut EntityModifier<'_, T>),
    ) -> EntityRef<T> {
        let handle = self.insert_entity(entity_source, fields);
        self.apply_modification(handle.id(), init);
        self.finish_mutation();
        handle
    }

    /// Run `modify` against the entity and record the net change.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist in this builder, or if a
    /// reference set inside `modify` points at a missing entity.
    pub fn modify_entity<T: WorkspaceEntity>(
        &mut self,
        handle: EntityRef<T>,
        modify: impl FnOnce(&mut EntityModifier<'_, T>),
    ) -> &EntityData<T> {
        let id = handle.id();
        self.apply_modification(id, modify);
        self.finish_mutation();
        match self.entity(handle) {
            Some(data) => data,
            None => panic!("{id} was removed while being modified"),
        }
    }

    /// Change the source tag of an entity. Setting the current source again
    /// is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist in this builder.
    pub fn change_source<T: WorkspaceEntity>(&mut self, handle: EntityRef<T>, entity_source: EntitySource) {
        if self.set_source(handle.id(), entity_source) {
            self.finish_mutation();
        }
    }

    /// Remove an entity and, recursively, all of its children.
    pub fn remove_entity<T: WorkspaceEntity>(&mut self, handle: EntityRef<T>) -> Vec<EntityId> {
        self.remove_entity_by_id(handle.id())
    }

    /// Remove an entity and all of its descendants. Returns the removed ids,
    /// children before parents.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist in this builder.
    pub fn remove_entity_by_id(&mut self, id: EntityId) -> Vec<EntityId> {
        assert!(self.contains(id), "cannot remove {id}: no such entity");
        let removed = self.remove_cascade(id);
        self.finish_mutation();
        removed
    }

    /// Write access to an external mapping of this builder, created empty
    /// on first use.
    ///
    /// # Panics
    ///
    /// Panics if the mapping already exists with a different value type.
    pub fn mutable_external_mapping<V: MappingValue>(
        &mut self,
        key: ExternalMappingKey<V>,
    ) -> MutableExternalMapping<'_, V> {
        let table = self.indexes.mapping_mut::<V>(key.name());
        MutableExternalMapping::new(table, &self.barrel)
    }

    /// Drop a whole external mapping. Returns `true` if it existed.
    pub fn remove_external_mapping<V>(&mut self, key: ExternalMappingKey<V>) -> bool {
        self.indexes.remove_mapping(key.name())
    }

    fn insert_entity<T: WorkspaceEntity>(&mut self, entity_source: EntitySource, fields: T) -> EntityRef<T> {
        let id = self.barrel.family_mut::<T>().add(entity_source, fields);
        self.register_added(id);
        EntityRef::from_id(id)
    }

    /// Index and log an entity that was just stored in its family.
    fn register_added(&mut self, id: EntityId) {
        let data = self.data_of(id);
        self.indexes.index_source(id, data.entity_source());
        self.change_log.record_add(&data);
        debug!(%id, source = %data.entity_source(), "entity added");
        if let Some(symbolic_id) = data.symbolic_id() {
            self.claim_symbolic_id(symbolic_id, id);
        }
    }

    fn apply_modification<T: WorkspaceEntity>(
        &mut self,
        id: EntityId,
        modify: impl FnOnce(&mut EntityModifier<'_, T>),
    ) {
        self.modify_with(id, |builder| {
            let data = builder.barrel.family_mut::<T>().get_for_modification(id.index);
            let mut modifier = EntityModifier::new(id, &mut data.fields);
            modify(&mut modifier);
            modifier.ref_ops
        });
    }

    /// Run `edit` against the entity, apply the reference updates it
    /// returns, and log the result.
    fn modify_with(&mut self, id: EntityId, edit: impl FnOnce(&mut Self) -> Vec<RefOp>) {
        let old_data = match self.entity_data(id) {
            Some(data) => data,
            None => panic!("cannot modify {id}: no such entity"),
        };
        let in_base = self.original.contains(id);
        let references_before = self.refs.references_of(id);

        let ref_ops = edit(self);
        let touched = self.apply_ref_ops(id, ref_ops);

        let new_data = self.data_of(id);
        let references_after = self.refs.references_of(id);
        self.change_log.record_replace(Modification {
            old_data: &old_data,
            new_data: &new_data,
            references_before: &references_before,
            references_after: &references_after,
            in_base,
        });
        self.record_side_effects(touched);

        let old_symbolic = old_data.symbolic_id();
        let new_symbolic = new_data.symbolic_id();
        if old_symbolic != new_symbolic {
            if let Some(old_symbolic) = &old_symbolic {
                self.indexes.unindex_symbolic(old_symbolic, id);
            }
            if let Some(new_symbolic) = new_symbolic {
                self.claim_symbolic_id(new_symbolic, id);
            }
        }
    }

    fn apply_ref_ops(&mut self, id: EntityId, ref_ops: Vec<RefOp>) -> TouchedReferences {
        let mut touched = TouchedReferences::new();
        for op in ref_ops {
            trace!(%id, ?op, "applying reference update");
            match op {
                RefOp::Children {
                    connection,
                    children,
                } => {
                    let mut candidates = self.refs.children(connection, id).to_vec();
                    for &child in &children {
                        self.assert_linkable(connection, child);
                        candidates.push(child);
                        candidates.extend(self.refs.parent(connection, child));
                    }
                    capture_references(&self.refs, &mut touched, candidates, id);
                    let affected = self.refs.replace_children(connection, id, &children);
                    debug_assert!(affected.iter().all(|a| *a == id || touched.contains_key(a)));
                }
                RefOp::Parent { connection, parent } => {
                    let mut candidates: Vec<EntityId> = self.refs.parent(connection, id).into_iter().collect();
                    if let Some(parent) = parent {
                        self.assert_linkable(connection, parent);
                        candidates.push(parent);
                        if connection.kind() == ConnectionKind::OneToOne {
                            candidates.extend_from_slice(self.refs.children(connection, parent));
                        }
                    }
                    capture_references(&self.refs, &mut touched, candidates, id);
                    let affected = self.refs.set_parent(connection, id, parent);
                    debug_assert!(affected.iter().all(|a| *a == id || touched.contains_key(a)));
                }
            }
        }
        touched
    }

    /// Record a data-preserving replace for every entity whose references
    /// changed as a consequence of a mutation on another entity.
    fn record_side_effects(&mut self, touched: TouchedReferences) {
        for (other, references_before) in touched {
            let references_after = self.refs.references_of(other);
            if references_after == references_before {
                continue;
            }
            let Some(data) = self.entity_data(other) else {
                continue;
            };
            trace!(id = %other, "references changed as a side effect");
            let in_base = self.original.contains(other);
            self.change_log.record_replace(Modification {
                old_data: &data,
                new_data: &data,
                references_before: &references_before,
                references_after: &references_after,
                in_base,
            });
            self.change_log.discard_if_unchanged(other);
        }
    }

    /// Returns `false` if the entity already has `entity_source`.
    fn set_source(&mut self, id: EntityId, entity_source: EntitySource) -> bool {
        let in_base = self.original.contains(id);
        let family = match self
            .barrel
            .erased_mut(id.entity_type)
            .filter(|family| family.contains(id.index))
        {
            Some(family) => family,
            None => panic!("cannot change source of {id}: no such entity"),
        };
        if family
            .erased_data(id.index)
            .is_some_and(|data| data.entity_source() == &entity_source)
        {
            return false;
        }
        let (before, after) = family.change_source(id.index, entity_source);
        self.indexes.unindex_source(id, before.entity_source());
        self.indexes.index_source(id, after.entity_source());
        self.change_log.record_change_source(&before, &after, in_base);
        true
    }

    fn remove_cascade(&mut self, id: EntityId) -> Vec<EntityId> {
        let mut doomed = Vec::new();
        self.refs.collect_descendants(id, &mut doomed);
        doomed.push(id);

        let mut survivors = TouchedReferences::new();
        for &entity in &doomed {
            let parents: Vec<EntityId> = self
                .refs
                .references_of(entity)
                .parents
                .into_values()
                .filter(|parent| !doomed.contains(parent))
                .collect();
            capture_references(&self.refs, &mut survivors, parents, entity);
        }

        for &entity in &doomed {
            let removed = self
                .barrel
                .erased_mut(entity.entity_type)
                .and_then(|family| family.remove_erased(entity.index));
            let Some(data) = removed else {
                continue;
            };
            self.refs.remove_entity(entity);
            self.indexes.unindex_source(entity, data.entity_source());
            if let Some(symbolic_id) = data.symbolic_id() {
                self.indexes.unindex_symbolic(&symbolic_id, entity);
            }
            self.indexes.remove_entity_mappings(entity);
            self.change_log.record_remove(&data);
            debug!(id = %entity, "entity removed");
        }

        self.record_side_effects(survivors);
        doomed
    }

    fn claim_symbolic_id(&mut self, symbolic_id: SymbolicId, id: EntityId) {
        if let Some(previous) = self.indexes.index_symbolic(symbolic_id.clone(), id) {
            error!(
                %id,
                %previous,
                name = %symbolic_id.name,
                "symbolic id already in use; removing the previous holder"
            );
            self.detach_from_doomed(id, previous);
            self.remove_cascade(previous);
        }
    }

    /// Cut `id` loose from every parent that the cascade removal of `root`
    /// would take down, so `id` survives it as an orphan.
    fn detach_from_doomed(&mut self, id: EntityId, root: EntityId) {
        let mut doomed = Vec::new();
        self.refs.collect_descendants(root, &mut doomed);
        if !doomed.contains(&id) {
            return;
        }
        doomed.push(root);

        let links: Vec<(ConnectionId, EntityId)> = self
            .refs
            .references_of(id)
            .parents
            .into_iter()
            .filter(|(_, parent)| doomed.contains(parent))
            .collect();
        let mut touched = TouchedReferences::new();
        touched.insert(id, self.refs.references_of(id));
        capture_references(&self.refs, &mut touched, links.iter().map(|&(_, parent)| parent), id);
        for (connection, parent) in links {
            debug!(%id, %parent, connection = connection.name(), "detaching from removed ancestor");
            self.refs.set_parent(connection, id, None);
        }
        self.record_side_effects(touched);
    }

    fn assert_linkable(&self, connection: ConnectionId, target: EntityId) {
        assert!(
            self.contains(target),
            "cannot link {target} through `{}`: no such entity",
            connection.name()
        );
    }

    fn data_of(&self, id: EntityId) -> ErasedData {
        match self.entity_data(id) {
            Some(data) => data,
            None => unreachable!("{id} was just written"),
        }
    }

    fn finish_mutation(&mut self) {
        self.change_log.bump_modification_count();
        if self.config.strict_consistency {
            if let Err(err) = self.check_consistency() {
                warn!(%err, "storage consistency check failed");
                panic!("inconsistent storage after mutation: {err}");
            }
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("entity_types", &self.entity_types().len())
            .field("pending_changes", &self.change_log.len())
            .field("modification_count", &self.change_log.modification_count())
            .field("config", &self.config)
            .finish()
    }
}

impl Sealed for Builder {}

impl EntityStorage for Builder {
    fn parts(&self) -> StorageParts<'_> {
        StorageParts {
            families: &self.barrel,
            refs: &self.refs,
            indexes: &self.indexes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::{ChangeEntry, ChangeKind};
    use crate::test_entities::{
        CHILDREN, ChildEntity, NamedEntity, PRIMARY_CHILD, ParentEntity, SUB_ENTITIES, add_parent_entity, source,
    };

    fn strict_builder() -> Builder {
        Builder::with_config(StorageConfig::default().with_strict_consistency(true))
    }

    fn add_child(builder: &mut Builder, property: &str) -> EntityRef<ChildEntity> {
        builder.add_entity(source("test"), ChildEntity::new(property))
    }

    fn committed_parent_with_children(count: usize) -> (Builder, EntityRef<ParentEntity>, Vec<EntityRef<ChildEntity>>) {
        let mut builder = strict_builder();
        let parent = add_parent_entity(&mut builder, "Parent");
        let children: Vec<_> = (0..count)
            .map(|i| add_child(&mut builder, &format!("child {i}")))
            .collect();
        let linked = children.clone();
        builder.modify_entity(parent, |m| {
            m.set_children(CHILDREN, linked);
        });
        builder.clear_change_log();
        (builder, parent, children)
    }

    fn property(data: &ErasedData) -> String {
        data.typed::<ParentEntity>()
            .map(|d| d.fields.parent_property.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_add_then_modify_nets_to_single_add() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.modify_entity(entity, |m| m.parent_property = "Another Parent".into());

        assert_eq!(builder.change_log().len(), 1);
        match builder.change_log().get(entity) {
            Some(ChangeEntry::AddEntity { data }) => assert_eq!(property(data), "Another Parent"),
            other => panic!("expected AddEntity, got {other:?}"),
        }
    }

    #[test]
    fn test_add_then_remove_leaves_no_entry() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.remove_entity(entity);
        assert!(builder.change_log().get(entity).is_none());
        assert!(!builder.has_changes());
        assert!(builder.entity(entity).is_none());
    }

    #[test]
    fn test_add_then_change_source_nets_to_add_with_new_source() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.change_source(entity, source("moved"));

        assert_eq!(builder.change_log().len(), 1);
        match builder.change_log().get(entity) {
            Some(ChangeEntry::AddEntity { data }) => assert_eq!(data.entity_source(), &source("moved")),
            other => panic!("expected AddEntity, got {other:?}"),
        }
    }

    #[test]
    fn test_modify_committed_entity_records_replace() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();

        builder.modify_entity(entity, |m| m.parent_property = "first".into());
        builder.modify_entity(entity, |m| m.parent_property = "second".into());

        match builder.change_log().get(entity) {
            Some(ChangeEntry::ReplaceEntity(replace)) => {
                assert_eq!(property(&replace.old_data), "Parent");
                assert_eq!(property(&replace.new_data), "second");
                assert!(replace.references_unchanged());
            }
            other => panic!("expected ReplaceEntity, got {other:?}"),
        }
    }

    #[test]
    fn test_change_source_on_committed_entity() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();
        builder.change_source(entity, source("a"));
        builder.change_source(entity, source("b"));

        match builder.change_log().get(entity) {
            Some(ChangeEntry::ChangeEntitySource(change)) => {
                assert_eq!(change.old_data.entity_source(), &source("test"));
                assert_eq!(change.new_data.entity_source(), &source("b"));
            }
            other => panic!("expected ChangeEntitySource, got {other:?}"),
        }
        assert_eq!(builder.entities_by_source(|s| s == &source("b")), vec![entity.id()]);
        assert!(builder.entities_by_source(|s| s == &source("test")).is_empty());
    }

    #[test]
    fn test_change_source_to_same_source_is_noop() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();
        let count = builder.modification_count();
        builder.change_source(entity, source("test"));
        assert!(!builder.has_changes());
        assert_eq!(builder.modification_count(), count);
    }

    fn assert_replace_and_change_source(builder: &Builder, entity: EntityRef<ParentEntity>) {
        assert_eq!(builder.change_log().len(), 1);
        match builder.change_log().get(entity) {
            Some(ChangeEntry::ReplaceAndChangeSource {
                data_change,
                source_change,
            }) => {
                assert_eq!(property(&data_change.old_data), "Parent");
                assert_eq!(property(&data_change.new_data), "Modified");
                assert_eq!(source_change.old_data.entity_source(), &source("test"));
                assert_eq!(source_change.new_data.entity_source(), &source("moved"));
            }
            other => panic!("expected ReplaceAndChangeSource, got {other:?}"),
        }
    }

    #[test]
    fn test_change_source_then_modify_gives_replace_and_change_source() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();

        builder.change_source(entity, source("moved"));
        builder.modify_entity(entity, |m| m.parent_property = "Modified".into());

        assert_replace_and_change_source(&builder, entity);
    }

    #[test]
    fn test_modify_then_change_source_gives_replace_and_change_source() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();

        builder.modify_entity(entity, |m| m.parent_property = "Modified".into());
        builder.change_source(entity, source("moved"));

        assert_replace_and_change_source(&builder, entity);
    }

    #[test]
    fn test_replace_and_change_source_keeps_latest_of_each_part() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();

        builder.modify_entity(entity, |m| m.parent_property = "first".into());
        builder.change_source(entity, source("first"));
        builder.modify_entity(entity, |m| m.parent_property = "Modified".into());
        builder.change_source(entity, source("moved"));

        assert_replace_and_change_source(&builder, entity);
        let current = builder.entity(entity).unwrap();
        assert_eq!(current.fields.parent_property, "Modified");
        assert_eq!(current.entity_source, source("moved"));
    }

    #[test]
    fn test_remove_after_modify_records_base_data() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();

        builder.modify_entity(entity, |m| m.parent_property = "Modified".into());
        builder.change_source(entity, source("moved"));
        builder.remove_entity(entity);

        match builder.change_log().get(entity) {
            Some(ChangeEntry::RemoveEntity { old_data }) => {
                assert_eq!(property(old_data), "Parent");
                assert_eq!(old_data.entity_source(), &source("test"));
            }
            other => panic!("expected RemoveEntity, got {other:?}"),
        }
    }

    #[test]
    fn test_children_added_then_cleared_net_to_empty_diff() {
        let (mut builder, parent, _) = committed_parent_with_children(0);
        let a = add_child(&mut builder, "a");
        let b = add_child(&mut builder, "b");

        builder.modify_entity(parent, |m| {
            m.set_children(CHILDREN, [a, b]);
        });
        builder.modify_entity(parent, |m| {
            m.set_children(CHILDREN, Vec::<EntityRef<ChildEntity>>::new());
        });

        match builder.change_log().get(parent) {
            Some(ChangeEntry::ReplaceEntity(replace)) => {
                assert_eq!(replace.removed_children.len(), 0);
                assert_eq!(replace.new_children.len(), 0);
            }
            other => panic!("expected ReplaceEntity, got {other:?}"),
        }
    }

    #[test]
    fn test_children_cleared_then_restored_net_to_empty_diff() {
        let (mut builder, parent, children) = committed_parent_with_children(2);

        builder.modify_entity(parent, |m| {
            m.set_children(CHILDREN, Vec::<EntityRef<ChildEntity>>::new());
        });
        assert_eq!(
            builder.change_log().get(parent).and_then(ChangeEntry::replace).map(|r| r.removed_children.len()),
            Some(2)
        );
        builder.modify_entity(parent, |m| {
            m.set_children(CHILDREN, children.clone());
        });

        match builder.change_log().get(parent) {
            Some(ChangeEntry::ReplaceEntity(replace)) => {
                assert_eq!(replace.removed_children.len(), 0);
                assert_eq!(replace.new_children.len(), 0);
            }
            other => panic!("expected ReplaceEntity, got {other:?}"),
        }
        assert_eq!(builder.change_log().len(), 1);
        for child in &children {
            assert!(builder.change_log().get(*child).is_none());
        }
        assert_eq!(builder.children_of::<ChildEntity>(CHILDREN, parent), children);
    }

    #[test]
    fn test_child_moved_away_and_back_leaves_no_entry() {
        let (mut builder, first, children) = committed_parent_with_children(1);
        let second = add_parent_entity(&mut builder, "Second");
        let child = children[0];

        builder.modify_entity(child, |m| {
            m.set_parent(CHILDREN, Some(second));
        });
        builder.modify_entity(second, |m| {
            m.set_children(CHILDREN, Vec::<EntityRef<ChildEntity>>::new());
        });
        builder.modify_entity(first, |m| {
            m.set_children(CHILDREN, [child]);
        });

        assert_eq!(builder.parent(CHILDREN, child), Some(first.id()));
        assert!(builder.change_log().get(child).is_none());
        assert!(builder.change_log().get(first).is_none());
        assert_eq!(
            builder.change_log().get(second).map(ChangeEntry::kind),
            Some(ChangeKind::Added)
        );
    }

    #[test]
    fn test_detached_child_records_modified_parent() {
        let (mut builder, parent, children) = committed_parent_with_children(2);

        builder.modify_entity(parent, |m| {
            m.set_children(CHILDREN, [children[1]]);
        });

        let replace = builder.change_log().get(parent).and_then(ChangeEntry::replace).unwrap();
        assert_eq!(replace.removed_children, vec![(CHILDREN, children[0].id())]);

        let child_change = builder.change_log().get(children[0]).and_then(ChangeEntry::replace).unwrap();
        assert_eq!(child_change.modified_parents.get(&CHILDREN), Some(&None));
        assert!(builder.change_log().get(children[1]).is_none());
        assert_eq!(builder.parent(CHILDREN, children[0]), None);
        assert!(builder.contains(children[0]));
    }

    #[test]
    fn test_set_parent_moves_child_between_parents() {
        let (mut builder, first, children) = committed_parent_with_children(1);
        let second = add_parent_entity(&mut builder, "Second");
        let child = children[0];

        builder.modify_entity(child, |m| {
            m.set_parent(CHILDREN, Some(second));
        });

        assert!(builder.children(CHILDREN, first).is_empty());
        assert_eq!(builder.children(CHILDREN, second), &[child.id()]);
        assert_eq!(builder.parent(CHILDREN, child), Some(second.id()));
        let first_change = builder.change_log().get(first).and_then(ChangeEntry::replace).unwrap();
        assert_eq!(first_change.removed_children, vec![(CHILDREN, child.id())]);
        assert_eq!(
            builder.change_log().get(second).map(ChangeEntry::kind),
            Some(ChangeKind::Added)
        );
    }

    #[test]
    fn test_one_to_one_child_replaces_previous() {
        let mut builder = strict_builder();
        let a = add_child(&mut builder, "a");
        let b = add_child(&mut builder, "b");
        let parent = builder.add_entity_with(source("test"), ParentEntity::new("Parent"), |m| {
            m.set_child(PRIMARY_CHILD, Some(a));
        });
        assert_eq!(builder.children(PRIMARY_CHILD, parent), &[a.id()]);

        builder.modify_entity(parent, |m| {
            m.set_child(PRIMARY_CHILD, Some(b));
        });
        assert_eq!(builder.children(PRIMARY_CHILD, parent), &[b.id()]);
        assert_eq!(builder.parent(PRIMARY_CHILD, a), None);
    }

    #[test]
    fn test_remove_cascades_to_children() {
        let (mut builder, parent, children) = committed_parent_with_children(2);
        let removed = builder.remove_entity(parent);

        assert_eq!(removed, vec![children[0].id(), children[1].id(), parent.id()]);
        assert!(builder.is_empty());
        for child in &children {
            assert_eq!(
                builder.change_log().get(*child).map(ChangeEntry::kind),
                Some(ChangeKind::Removed)
            );
        }
    }

    #[test]
    fn test_removing_child_updates_surviving_parent() {
        let (mut builder, parent, children) = committed_parent_with_children(2);
        builder.remove_entity(children[0]);

        assert_eq!(builder.children(CHILDREN, parent), &[children[1].id()]);
        let replace = builder.change_log().get(parent).and_then(ChangeEntry::replace).unwrap();
        assert_eq!(replace.removed_children, vec![(CHILDREN, children[0].id())]);
        assert_eq!(property(&replace.new_data), "Parent");
    }

    #[test]
    #[should_panic(expected = "no such entity")]
    fn test_modify_removed_entity_panics() {
        let mut builder = Builder::new();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.remove_entity(entity);
        builder.modify_entity(entity, |m| m.parent_property = "zombie".into());
    }

    #[test]
    #[should_panic(expected = "no such entity")]
    fn test_linking_missing_entity_panics() {
        let mut builder = Builder::new();
        let parent = add_parent_entity(&mut builder, "Parent");
        let child = add_child(&mut builder, "child");
        builder.remove_entity(child);
        builder.modify_entity(parent, |m| {
            m.set_children(CHILDREN, [child]);
        });
    }

    #[test]
    #[should_panic(expected = "does not link")]
    fn test_wrong_connection_direction_panics() {
        let mut builder = Builder::new();
        let parent = add_parent_entity(&mut builder, "Parent");
        builder.modify_entity(parent, |m| {
            m.set_parent::<ParentEntity>(CHILDREN, None);
        });
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        let snapshot = builder.to_snapshot();

        builder.modify_entity(entity, |m| m.parent_property = "Changed".into());
        add_parent_entity(&mut builder, "Extra");

        assert_eq!(snapshot.entity_count::<ParentEntity>(), 1);
        assert_eq!(snapshot.entity(entity).unwrap().fields.parent_property, "Parent");
        assert_eq!(builder.entity_count::<ParentEntity>(), 2);
    }

    #[test]
    fn test_fork_from_snapshot_and_builder() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        let mut fork = Builder::from_builder(&builder);

        assert!(fork.config().strict_consistency);
        assert!(!fork.has_changes());
        fork.modify_entity(entity, |m| m.parent_property = "Fork".into());

        assert_eq!(builder.entity(entity).unwrap().fields.parent_property, "Parent");
        assert_eq!(
            fork.change_log().get(entity).map(ChangeEntry::kind),
            Some(ChangeKind::Replaced)
        );

        let from_snapshot = builder.to_snapshot().to_builder();
        assert_eq!(from_snapshot.entity_count::<ParentEntity>(), 1);
    }

    #[test]
    fn test_external_mapping_is_isolated_after_fork() {
        const KEY: ExternalMappingKey<u32> = ExternalMappingKey::new("test.mapping");

        let mut builder = strict_builder();
        let first = add_parent_entity(&mut builder, "first");
        builder.mutable_external_mapping(KEY).add_mapping(first, 1);
        let another = Builder::from_builder(&builder);

        let second = add_parent_entity(&mut builder, "second");
        builder.mutable_external_mapping(KEY).add_mapping(second, 2);

        assert!(another.external_mapping(KEY).get_entities(&2).is_empty());
        assert_eq!(another.external_mapping(KEY).get_entities(&1), vec![first.id()]);
        assert_eq!(builder.external_mapping(KEY).get_entities(&2), vec![second.id()]);
    }

    #[test]
    fn test_external_mapping_dropped_with_entity() {
        const KEY: ExternalMappingKey<&'static str> = ExternalMappingKey::new("test.names");

        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.mutable_external_mapping(KEY).add_mapping(entity, "bridge");
        let snapshot = builder.to_snapshot();

        builder.remove_entity(entity);
        assert_eq!(builder.external_mapping(KEY).size(), 0);
        assert_eq!(snapshot.external_mapping(KEY).get_data_by_entity(entity), Some(&"bridge"));

        assert!(builder.remove_external_mapping(KEY));
        assert!(!builder.remove_external_mapping(KEY));
    }

    #[test]
    #[should_panic(expected = "cannot map")]
    fn test_mapping_missing_entity_panics() {
        const KEY: ExternalMappingKey<u32> = ExternalMappingKey::new("test.mapping");
        let mut builder = Builder::new();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.remove_entity(entity);
        builder.mutable_external_mapping(KEY).add_mapping(entity, 1);
    }

    #[test]
    fn test_symbolic_id_resolves_and_follows_renames() {
        let mut builder = strict_builder();
        let entity = builder.add_entity(source("test"), NamedEntity::new("core"));
        assert_eq!(builder.resolve::<NamedEntity>("core").map(EntityData::id), Some(entity.id()));

        builder.modify_entity(entity, |m| m.name = "core-impl".into());
        assert!(builder.resolve::<NamedEntity>("core").is_none());
        assert_eq!(
            builder.resolve::<NamedEntity>("core-impl").map(EntityData::id),
            Some(entity.id())
        );
    }

    #[test]
    fn test_symbolic_id_collision_removes_previous_holder() {
        let mut builder = strict_builder();
        let first = builder.add_entity(source("test"), NamedEntity::new("core"));
        builder.clear_change_log();
        let second = builder.add_entity(source("test"), NamedEntity::new("core"));

        assert!(!builder.contains(first));
        assert_eq!(builder.resolve::<NamedEntity>("core").map(EntityData::id), Some(second.id()));
        assert_eq!(
            builder.change_log().get(first).map(ChangeEntry::kind),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn test_rename_to_ancestor_name_keeps_renamed_entity() {
        let mut builder = strict_builder();
        let root = builder.add_entity(source("test"), NamedEntity::new("root"));
        let sibling = builder.add_entity(source("test"), NamedEntity::new("sibling"));
        let child = builder.add_entity_with(source("test"), NamedEntity::new("child"), |m| {
            m.set_parent(SUB_ENTITIES, Some(root));
        });
        builder.modify_entity(root, |m| {
            m.set_children(SUB_ENTITIES, [child, sibling]);
        });
        builder.clear_change_log();

        let renamed = builder.modify_entity(child, |m| m.name = "root".into());
        assert_eq!(renamed.fields.name, "root");

        assert!(!builder.contains(root));
        assert!(!builder.contains(sibling));
        assert!(builder.contains(child));
        assert_eq!(builder.resolve::<NamedEntity>("root").map(EntityData::id), Some(child.id()));
        assert_eq!(builder.parent(SUB_ENTITIES, child), None);

        let replace = builder.change_log().get(child).and_then(ChangeEntry::replace).unwrap();
        assert_eq!(replace.modified_parents.get(&SUB_ENTITIES), Some(&None));
        assert_eq!(
            builder.change_log().get(root).map(ChangeEntry::kind),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn test_change_source_then_remove_records_base_data() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();

        builder.change_source(entity, source("moved"));
        builder.remove_entity(entity);

        assert_eq!(builder.change_log().len(), 1);
        match builder.change_log().get(entity) {
            Some(ChangeEntry::RemoveEntity { old_data }) => {
                assert_eq!(property(old_data), "Parent");
                assert_eq!(old_data.entity_source(), &source("test"));
            }
            other => panic!("expected RemoveEntity, got {other:?}"),
        }
        assert!(builder.entities_by_source(|s| s == &source("moved")).is_empty());
    }

    #[test]
    fn test_clear_change_log_rebases() {
        let mut builder = strict_builder();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();
        assert!(!builder.has_changes());
        assert!(builder.original().contains(entity));
        assert_eq!(builder.modification_count(), 1);

        builder.remove_entity(entity);
        assert_eq!(
            builder.change_log().get(entity).map(ChangeEntry::kind),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn test_change_log_keeps_first_touch_order() {
        let mut builder = strict_builder();
        let a = add_parent_entity(&mut builder, "a");
        let b = add_parent_entity(&mut builder, "b");
        builder.clear_change_log();

        builder.modify_entity(b, |m| m.parent_property = "b2".into());
        builder.modify_entity(a, |m| m.parent_property = "a2".into());
        builder.change_source(b, source("moved"));

        let order: Vec<EntityId> = builder.change_log().iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![b.id(), a.id()]);
    }
}
