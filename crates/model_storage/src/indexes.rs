//! Secondary indexes kept next to the entity families.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::entity::{EntityId, EntitySource, SymbolicId};
use crate::external::{ErasedMappingTable, MappingTable, MappingValue, table_mut};

/// Source index, symbolic-id index and external mapping tables. Every part
/// is shared copy-on-write between a snapshot and the builders forked from
/// it.
#[derive(Debug, Clone, Default)]
pub(crate) struct StorageIndexes {
    entity_sources: Arc<HashMap<EntitySource, BTreeSet<EntityId>>>,
    symbolic_ids: Arc<HashMap<SymbolicId, EntityId>>,
    external_mappings: HashMap<&'static str, Arc<dyn ErasedMappingTable>>,
}

impl StorageIndexes {
    pub(crate) fn entities_by_source(&self, mut filter: impl FnMut(&EntitySource) -> bool) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entity_sources
            .iter()
            .filter(|(source, _)| filter(source))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn source_entries(&self) -> impl Iterator<Item = (&EntitySource, &BTreeSet<EntityId>)> {
        self.entity_sources.iter()
    }

    pub(crate) fn source_contains(&self, source: &EntitySource, id: EntityId) -> bool {
        self.entity_sources
            .get(source)
            .is_some_and(|ids| ids.contains(&id))
    }

    pub(crate) fn index_source(&mut self, id: EntityId, source: &EntitySource) {
        Arc::make_mut(&mut self.entity_sources)
            .entry(source.clone())
            .or_default()
            .insert(id);
    }

    pub(crate) fn unindex_source(&mut self, id: EntityId, source: &EntitySource) {
        let sources = Arc::make_mut(&mut self.entity_sources);
        if let Some(ids) = sources.get_mut(source) {
            ids.remove(&id);
            if ids.is_empty() {
                sources.remove(source);
            }
        }
    }

    pub(crate) fn resolve_symbolic(&self, symbolic_id: &SymbolicId) -> Option<EntityId> {
        self.symbolic_ids.get(symbolic_id).copied()
    }

    pub(crate) fn symbolic_entries(&self) -> impl Iterator<Item = (&SymbolicId, &EntityId)> {
        self.symbolic_ids.iter()
    }

    /// Point `symbolic_id` at `id`. Returns the entity that held the name
    /// before, if it was a different one.
    pub(crate) fn index_symbolic(&mut self, symbolic_id: SymbolicId, id: EntityId) -> Option<EntityId> {
        Arc::make_mut(&mut self.symbolic_ids)
            .insert(symbolic_id, id)
            .filter(|&previous| previous != id)
    }

    /// Forget `symbolic_id` if it still points at `id`.
    pub(crate) fn unindex_symbolic(&mut self, symbolic_id: &SymbolicId, id: EntityId) {
        if self.symbolic_ids.get(symbolic_id) == Some(&id) {
            Arc::make_mut(&mut self.symbolic_ids).remove(symbolic_id);
        }
    }

    pub(crate) fn mapping(&self, name: &str) -> Option<&Arc<dyn ErasedMappingTable>> {
        self.external_mappings.get(name)
    }

    pub(crate) fn mapping_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.external_mappings.keys().copied()
    }

    pub(crate) fn mapping_mut<V: MappingValue>(&mut self, name: &'static str) -> &mut MappingTable<V> {
        let slot = self
            .external_mappings
            .entry(name)
            .or_insert_with(|| Arc::new(MappingTable::<V>::default()));
        table_mut(slot, name)
    }

    /// Apply the difference between `base` and `changed` to the mapping
    /// called `name`, creating it if needed.
    pub(crate) fn merge_mapping(
        &mut self,
        name: &'static str,
        changed: &(dyn ErasedMappingTable + 'static),
        base: Option<&(dyn ErasedMappingTable + 'static)>,
        remap: &mut dyn FnMut(EntityId) -> Option<EntityId>,
    ) {
        let slot = self
            .external_mappings
            .entry(name)
            .or_insert_with(|| changed.empty_table());
        if Arc::get_mut(slot).is_none() {
            *slot = slot.clone_table();
        }
        if let Some(target) = Arc::get_mut(slot) {
            changed.merge_changes(name, base, target, remap);
        }
    }

    /// Drop a whole mapping. Returns `true` if it existed.
    pub(crate) fn remove_mapping(&mut self, name: &str) -> bool {
        self.external_mappings.remove(name).is_some()
    }

    /// Drop `id` from every mapping that mentions it.
    pub(crate) fn remove_entity_mappings(&mut self, id: EntityId) {
        for slot in self.external_mappings.values_mut() {
            if !slot.contains_entity(id) {
                continue;
            }
            if Arc::get_mut(slot).is_none() {
                *slot = slot.clone_table();
            }
            if let Some(table) = Arc::get_mut(slot) {
                table.remove_entity(id);
            }
        }
    }
}
