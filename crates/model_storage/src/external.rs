//! Caller-defined side tables keyed by entity.
//!
//! An external mapping attaches a value to entities without touching their
//! schema, and can look entities up by value. Each table lives behind an
//! `Arc` and is copied on the first write from a builder that shares it, the
//! same way entity families are.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};

use crate::entity::EntityId;
use crate::family::FamilyLookup;

/// Values that can be stored in an external mapping.
pub trait MappingValue: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<V: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static> MappingValue for V {}

/// Names one external mapping and fixes its value type.
///
/// ```rust
/// use model_storage::ExternalMappingKey;
///
/// const MODULE_BRIDGES: ExternalMappingKey<u64> = ExternalMappingKey::new("module.bridges");
/// assert_eq!(MODULE_BRIDGES.name(), "module.bridges");
/// ```
pub struct ExternalMappingKey<V> {
    name: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> ExternalMappingKey<V> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<V> Clone for ExternalMappingKey<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for ExternalMappingKey<V> {}

impl<V> fmt::Debug for ExternalMappingKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExternalMappingKey({})", self.name)
    }
}

/// Bidirectional entity/value table behind one mapping key.
#[derive(Debug, Clone)]
pub struct MappingTable<V> {
    data_by_entity: HashMap<EntityId, V>,
    entities_by_data: HashMap<V, BTreeSet<EntityId>>,
}

impl<V> Default for MappingTable<V> {
    fn default() -> Self {
        Self {
            data_by_entity: HashMap::new(),
            entities_by_data: HashMap::new(),
        }
    }
}

impl<V: MappingValue> MappingTable<V> {
    /// Every entity mapped to `value`, in id order.
    #[must_use]
    pub fn get_entities(&self, value: &V) -> Vec<EntityId> {
        self.entities_by_data
            .get(value)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_data_by_entity(&self, entity: impl Into<EntityId>) -> Option<&V> {
        self.data_by_entity.get(&entity.into())
    }

    /// Number of mapped entities.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data_by_entity.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_by_entity.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &V)> {
        self.data_by_entity.iter().map(|(&id, value)| (id, value))
    }

    fn insert(&mut self, id: EntityId, value: V) -> Option<V> {
        let previous = self.remove(id);
        self.entities_by_data
            .entry(value.clone())
            .or_default()
            .insert(id);
        self.data_by_entity.insert(id, value);
        previous
    }

    fn remove(&mut self, id: EntityId) -> Option<V> {
        let value = self.data_by_entity.remove(&id)?;
        if let Some(ids) = self.entities_by_data.get_mut(&value) {
            ids.remove(&id);
            if ids.is_empty() {
                self.entities_by_data.remove(&value);
            }
        }
        Some(value)
    }
}

/// Operations the storage needs on a table without knowing its value type.
pub(crate) trait ErasedMappingTable: DowncastSync + fmt::Debug {
    fn clone_table(&self) -> Arc<dyn ErasedMappingTable>;
    fn contains_entity(&self, id: EntityId) -> bool;
    fn remove_entity(&mut self, id: EntityId);
    fn entity_ids(&self) -> Vec<EntityId>;
    /// An empty table with the same value type.
    fn empty_table(&self) -> Arc<dyn ErasedMappingTable>;
    /// Write into `target` every mapping that differs between `base` and
    /// this table. `remap` translates ids into `target`'s storage and
    /// returns `None` for entities that do not exist there.
    fn merge_changes(
        &self,
        name: &str,
        base: Option<&(dyn ErasedMappingTable + 'static)>,
        target: &mut (dyn ErasedMappingTable + 'static),
        remap: &mut dyn FnMut(EntityId) -> Option<EntityId>,
    );
}

impl_downcast!(sync ErasedMappingTable);

impl<V: MappingValue> ErasedMappingTable for MappingTable<V> {
    fn clone_table(&self) -> Arc<dyn ErasedMappingTable> {
        Arc::new(self.clone())
    }

    fn contains_entity(&self, id: EntityId) -> bool {
        self.data_by_entity.contains_key(&id)
    }

    fn remove_entity(&mut self, id: EntityId) {
        self.remove(id);
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        self.data_by_entity.keys().copied().collect()
    }

    fn empty_table(&self) -> Arc<dyn ErasedMappingTable> {
        Arc::new(Self::default())
    }

    fn merge_changes(
        &self,
        name: &str,
        base: Option<&(dyn ErasedMappingTable + 'static)>,
        target: &mut (dyn ErasedMappingTable + 'static),
        remap: &mut dyn FnMut(EntityId) -> Option<EntityId>,
    ) {
        let base = base.map(|base| {
            base.downcast_ref::<Self>()
                .unwrap_or_else(|| wrong_value_type(name))
        });
        let Some(target) = target.downcast_mut::<Self>() else {
            wrong_value_type(name)
        };
        for (id, value) in self.iter() {
            if base.and_then(|base| base.get_data_by_entity(id)) == Some(value) {
                continue;
            }
            if let Some(id) = remap(id) {
                target.insert(id, value.clone());
            }
        }
        for (id, _) in base.into_iter().flat_map(MappingTable::iter) {
            if !self.data_by_entity.contains_key(&id) {
                if let Some(id) = remap(id) {
                    target.remove(id);
                }
            }
        }
    }
}

fn wrong_value_type(name: &str) -> ! {
    panic!("external mapping `{name}` is registered with a different value type")
}

/// Exclusive access to the table behind `slot`, copying it first if another
/// storage still shares it.
pub(crate) fn table_mut<'a, V: MappingValue>(
    slot: &'a mut Arc<dyn ErasedMappingTable>,
    name: &str,
) -> &'a mut MappingTable<V> {
    if Arc::get_mut(slot).is_none() {
        *slot = slot.clone_table();
    }
    match Arc::get_mut(slot).and_then(|table| table.downcast_mut::<MappingTable<V>>()) {
        Some(table) => table,
        None => wrong_value_type(name),
    }
}

/// Read-only view of one mapping, detached from the storage it came from.
#[derive(Debug, Clone)]
pub struct ExternalMapping<V> {
    table: Arc<MappingTable<V>>,
}

impl<V: MappingValue> ExternalMapping<V> {
    pub(crate) fn from_shared(table: Option<&Arc<dyn ErasedMappingTable>>, name: &str) -> Self {
        let table = match table {
            Some(table) => match Arc::clone(table).downcast_arc::<MappingTable<V>>() {
                Ok(table) => table,
                Err(_) => wrong_value_type(name),
            },
            None => Arc::new(MappingTable::default()),
        };
        Self { table }
    }
}

impl<V> std::ops::Deref for ExternalMapping<V> {
    type Target = MappingTable<V>;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

/// Write access to one mapping of a builder.
pub struct MutableExternalMapping<'a, V> {
    table: &'a mut MappingTable<V>,
    families: &'a dyn FamilyLookup,
}

impl<'a, V: MappingValue> MutableExternalMapping<'a, V> {
    pub(crate) fn new(table: &'a mut MappingTable<V>, families: &'a dyn FamilyLookup) -> Self {
        Self { table, families }
    }

    /// Map `entity` to `value`, replacing any previous value.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist in the owning builder.
    pub fn add_mapping(&mut self, entity: impl Into<EntityId>, value: V) -> Option<V> {
        let id = entity.into();
        assert!(
            self.families.contains(id),
            "cannot map {id}: no such entity in this builder"
        );
        self.table.insert(id, value)
    }

    pub fn remove_mapping(&mut self, entity: impl Into<EntityId>) -> Option<V> {
        self.table.remove(entity.into())
    }
}

impl<V> std::ops::Deref for MutableExternalMapping<'_, V> {
    type Target = MappingTable<V>;

    fn deref(&self) -> &Self::Target {
        self.table
    }
}
