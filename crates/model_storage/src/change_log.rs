//! Compacted record of what a builder changed since its base snapshot.
//!
//! The log holds at most one [`ChangeEntry`] per entity id. Every mutation
//! folds into the existing entry, so the log always describes the net
//! transformation from the base snapshot to the builder's current state:
//!
//! | entry                    | add   | modify                   | change source            | remove         |
//! |--------------------------|-------|--------------------------|--------------------------|----------------|
//! | none, id in base         | -     | `ReplaceEntity`          | `ChangeEntitySource`     | `RemoveEntity` |
//! | none, id not in base     | `AddEntity` | `AddEntity`        | `AddEntity`              | -              |
//! | `AddEntity`              | panic | `AddEntity`              | `AddEntity`              | entry deleted  |
//! | `ReplaceEntity`          | panic | `ReplaceEntity`          | `ReplaceAndChangeSource` | `RemoveEntity` |
//! | `ChangeEntitySource`     | panic | `ReplaceAndChangeSource` | `ChangeEntitySource`     | `RemoveEntity` |
//! | `ReplaceAndChangeSource` | panic | `ReplaceAndChangeSource` | `ReplaceAndChangeSource` | `RemoveEntity` |
//! | `RemoveEntity`           | panic | panic                    | panic                    | panic          |
//!
//! A `RemoveEntity` that follows a modification carries the data from the
//! base snapshot, not the intermediate state.
//!
//! When a mutation of one entity changes the references of another, the
//! other entity gets a data-preserving `ReplaceEntity`. That entry is
//! dropped again once its data and references match the base snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::trace;

use crate::entity::{EntityId, ErasedData, ErasedEntityData};
use crate::refs::{ConnectionId, EntityReferences};

/// Net kind of a change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    Added,
    Removed,
    Replaced,
    SourceChanged,
    ReplacedAndSourceChanged,
}

/// A data change on an entity that existed in the base snapshot.
///
/// The reference lists are always relative to the references the entity had
/// before the first change of the epoch, so a sequence of modifications that
/// returns to the original children nets to empty lists.
#[derive(Debug, Clone)]
pub struct ReplaceEntity {
    pub old_data: ErasedData,
    pub new_data: ErasedData,
    /// Children present now that were not present before.
    pub new_children: Vec<(ConnectionId, EntityId)>,
    /// Children present before that are gone now.
    pub removed_children: Vec<(ConnectionId, EntityId)>,
    /// Parent references that differ from before. `None` means detached.
    pub modified_parents: BTreeMap<ConnectionId, Option<EntityId>>,
    baseline: EntityReferences,
}

impl ReplaceEntity {
    fn new(old_data: ErasedData, new_data: ErasedData, baseline: EntityReferences) -> Self {
        Self {
            old_data,
            new_data,
            new_children: Vec::new(),
            removed_children: Vec::new(),
            modified_parents: BTreeMap::new(),
            baseline,
        }
    }

    fn update_references(&mut self, current: &EntityReferences) {
        self.new_children = current
            .children
            .iter()
            .filter(|child| !self.baseline.children.contains(child))
            .copied()
            .collect();
        self.removed_children = self
            .baseline
            .children
            .iter()
            .filter(|child| !current.children.contains(child))
            .copied()
            .collect();

        let mut modified_parents = BTreeMap::new();
        for connection in self.baseline.parents.keys().chain(current.parents.keys()) {
            let before = self.baseline.parents.get(connection);
            let after = current.parents.get(connection);
            if before != after {
                modified_parents.insert(*connection, after.copied());
            }
        }
        self.modified_parents = modified_parents;
    }

    /// Returns `true` if the entity's references are the same as before the
    /// first change.
    #[must_use]
    pub fn references_unchanged(&self) -> bool {
        self.new_children.is_empty()
            && self.removed_children.is_empty()
            && self.modified_parents.is_empty()
    }
}

/// A source-only change on an entity that existed in the base snapshot.
#[derive(Debug, Clone)]
pub struct ChangeEntitySource {
    pub old_data: ErasedData,
    pub new_data: ErasedData,
}

#[derive(Debug, Clone)]
pub enum ChangeEntry {
    AddEntity {
        data: ErasedData,
    },
    RemoveEntity {
        old_data: ErasedData,
    },
    ReplaceEntity(ReplaceEntity),
    ChangeEntitySource(ChangeEntitySource),
    ReplaceAndChangeSource {
        data_change: ReplaceEntity,
        source_change: ChangeEntitySource,
    },
}

impl ChangeEntry {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::AddEntity { .. } => ChangeKind::Added,
            Self::RemoveEntity { .. } => ChangeKind::Removed,
            Self::ReplaceEntity(_) => ChangeKind::Replaced,
            Self::ChangeEntitySource(_) => ChangeKind::SourceChanged,
            Self::ReplaceAndChangeSource { .. } => ChangeKind::ReplacedAndSourceChanged,
        }
    }

    /// The entity as it was in the base snapshot, if it existed there.
    #[must_use]
    pub fn old_data(&self) -> Option<&ErasedData> {
        match self {
            Self::AddEntity { .. } => None,
            Self::RemoveEntity { old_data } => Some(old_data),
            Self::ReplaceEntity(replace) => Some(&replace.old_data),
            Self::ChangeEntitySource(change) => Some(&change.old_data),
            Self::ReplaceAndChangeSource { data_change, .. } => Some(&data_change.old_data),
        }
    }

    /// The latest data recorded for the entity, if it still exists.
    #[must_use]
    pub fn new_data(&self) -> Option<&ErasedData> {
        match self {
            Self::AddEntity { data } => Some(data),
            Self::RemoveEntity { .. } => None,
            Self::ReplaceEntity(replace) => Some(&replace.new_data),
            Self::ChangeEntitySource(change) => Some(&change.new_data),
            Self::ReplaceAndChangeSource { data_change, .. } => Some(&data_change.new_data),
        }
    }

    /// The reference diff, for entries that carry one.
    #[must_use]
    pub fn replace(&self) -> Option<&ReplaceEntity> {
        match self {
            Self::ReplaceEntity(replace) => Some(replace),
            Self::ReplaceAndChangeSource { data_change, .. } => Some(data_change),
            _ => None,
        }
    }
}

/// Inputs of one recorded modification.
pub(crate) struct Modification<'a> {
    pub(crate) old_data: &'a ErasedData,
    pub(crate) new_data: &'a ErasedData,
    /// References before this modification, used only when the entry is new.
    pub(crate) references_before: &'a EntityReferences,
    pub(crate) references_after: &'a EntityReferences,
    /// Whether the id exists in the base snapshot.
    pub(crate) in_base: bool,
}

#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: IndexMap<EntityId, ChangeEntry>,
    modification_count: u64,
}

impl ChangeLog {
    /// Number of entities with a pending change.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: impl Into<EntityId>) -> Option<&ChangeEntry> {
        self.entries.get(&id.into())
    }

    /// Entries in the order their ids were first touched.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &ChangeEntry)> {
        self.entries.iter().map(|(&id, entry)| (id, entry))
    }

    /// Total number of mutations ever recorded. Not reset by [`clear`](Self::clear).
    #[must_use]
    pub fn modification_count(&self) -> u64 {
        self.modification_count
    }

    pub(crate) fn bump_modification_count(&mut self) {
        self.modification_count += 1;
    }

    /// Drop every entry.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn record_add(&mut self, data: &ErasedData) {
        let id = data.id();
        assert!(
            !self.entries.contains_key(&id),
            "{id} is added but already has a pending change"
        );
        trace!(%id, "unchanged -> AddEntity");
        self.entries.insert(
            id,
            ChangeEntry::AddEntity {
                data: Arc::clone(data),
            },
        );
    }

    pub(crate) fn record_replace(&mut self, modification: Modification<'_>) {
        let id = modification.new_data.id();
        let new_data = Arc::clone(modification.new_data);
        let (position, existing) = self.take_entry(id);
        let entry = match existing {
            None if !modification.in_base => {
                trace!(%id, "unchanged -> AddEntity (modify)");
                ChangeEntry::AddEntity { data: new_data }
            }
            None => {
                trace!(%id, "unchanged -> ReplaceEntity");
                let mut replace = ReplaceEntity::new(
                    Arc::clone(modification.old_data),
                    new_data,
                    modification.references_before.clone(),
                );
                replace.update_references(modification.references_after);
                ChangeEntry::ReplaceEntity(replace)
            }
            Some(ChangeEntry::AddEntity { .. }) => {
                trace!(%id, "AddEntity -> AddEntity (modify)");
                ChangeEntry::AddEntity { data: new_data }
            }
            Some(ChangeEntry::RemoveEntity { .. }) => panic!("{id} is modified after removal"),
            Some(ChangeEntry::ReplaceEntity(mut replace)) => {
                trace!(%id, "ReplaceEntity -> ReplaceEntity");
                replace.new_data = new_data;
                replace.update_references(modification.references_after);
                ChangeEntry::ReplaceEntity(replace)
            }
            Some(ChangeEntry::ChangeEntitySource(source_change)) => {
                trace!(%id, "ChangeEntitySource -> ReplaceAndChangeSource");
                let mut data_change = ReplaceEntity::new(
                    Arc::clone(&source_change.old_data),
                    new_data,
                    modification.references_before.clone(),
                );
                data_change.update_references(modification.references_after);
                ChangeEntry::ReplaceAndChangeSource {
                    data_change,
                    source_change,
                }
            }
            Some(ChangeEntry::ReplaceAndChangeSource {
                mut data_change,
                source_change,
            }) => {
                trace!(%id, "ReplaceAndChangeSource -> ReplaceAndChangeSource (modify)");
                data_change.new_data = new_data;
                data_change.update_references(modification.references_after);
                ChangeEntry::ReplaceAndChangeSource {
                    data_change,
                    source_change,
                }
            }
        };
        self.put_entry(id, position, entry);
    }

    pub(crate) fn record_change_source(&mut self, old_data: &ErasedData, new_data: &ErasedData, in_base: bool) {
        let id = new_data.id();
        let new_data = Arc::clone(new_data);
        let (position, existing) = self.take_entry(id);
        let entry = match existing {
            None if !in_base => {
                trace!(%id, "unchanged -> AddEntity (change source)");
                ChangeEntry::AddEntity { data: new_data }
            }
            None => {
                trace!(%id, "unchanged -> ChangeEntitySource");
                ChangeEntry::ChangeEntitySource(ChangeEntitySource {
                    old_data: Arc::clone(old_data),
                    new_data,
                })
            }
            Some(ChangeEntry::AddEntity { .. }) => {
                trace!(%id, "AddEntity -> AddEntity (change source)");
                ChangeEntry::AddEntity { data: new_data }
            }
            Some(ChangeEntry::RemoveEntity { .. }) => {
                panic!("source of {id} is changed after removal")
            }
            Some(ChangeEntry::ReplaceEntity(data_change)) => {
                trace!(%id, "ReplaceEntity -> ReplaceAndChangeSource");
                let source_change = ChangeEntitySource {
                    old_data: Arc::clone(&data_change.old_data),
                    new_data,
                };
                ChangeEntry::ReplaceAndChangeSource {
                    data_change,
                    source_change,
                }
            }
            Some(ChangeEntry::ChangeEntitySource(mut source_change)) => {
                trace!(%id, "ChangeEntitySource -> ChangeEntitySource");
                source_change.new_data = new_data;
                ChangeEntry::ChangeEntitySource(source_change)
            }
            Some(ChangeEntry::ReplaceAndChangeSource {
                data_change,
                mut source_change,
            }) => {
                trace!(%id, "ReplaceAndChangeSource -> ReplaceAndChangeSource (change source)");
                source_change.new_data = new_data;
                ChangeEntry::ReplaceAndChangeSource {
                    data_change,
                    source_change,
                }
            }
        };
        self.put_entry(id, position, entry);
    }

    /// `current` is the data the entity had right before removal.
    pub(crate) fn record_remove(&mut self, current: &ErasedData) {
        let id = current.id();
        let old_data = match self.entries.get(&id) {
            None => {
                trace!(%id, "unchanged -> RemoveEntity");
                Arc::clone(current)
            }
            Some(ChangeEntry::AddEntity { .. }) => {
                trace!(%id, "AddEntity -> unchanged");
                self.entries.shift_remove(&id);
                return;
            }
            Some(ChangeEntry::RemoveEntity { .. }) => panic!("{id} is removed twice"),
            Some(entry) => {
                trace!(%id, from = ?entry.kind(), "-> RemoveEntity");
                match entry.old_data() {
                    Some(old_data) => Arc::clone(old_data),
                    None => unreachable!("only AddEntity has no old data"),
                }
            }
        };
        self.entries.insert(id, ChangeEntry::RemoveEntity { old_data });
    }

    /// Drop the entry of `id` if it is a `ReplaceEntity` whose data and
    /// references are back to what the base snapshot holds.
    pub(crate) fn discard_if_unchanged(&mut self, id: EntityId) {
        let unchanged = match self.entries.get(&id) {
            Some(ChangeEntry::ReplaceEntity(replace)) => {
                replace.references_unchanged() && replace.old_data.same_as(&*replace.new_data)
            }
            _ => false,
        };
        if unchanged {
            trace!(%id, "ReplaceEntity -> unchanged");
            self.entries.shift_remove(&id);
        }
    }

    fn take_entry(&mut self, id: EntityId) -> (Option<usize>, Option<ChangeEntry>) {
        match self.entries.swap_remove_full(&id) {
            Some((index, _, entry)) => (Some(index), Some(entry)),
            None => (None, None),
        }
    }

    /// Put an entry taken with [`take_entry`](Self::take_entry) back where it was.
    fn put_entry(&mut self, id: EntityId, position: Option<usize>, entry: ChangeEntry) {
        let (last, _) = self.entries.insert_full(id, entry);
        if let Some(index) = position {
            self.entries.swap_indices(index, last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityData, EntityTypeId};
    use crate::test_entities::{ParentEntity, source};

    fn data(index: u32, property: &str, entity_source: &str) -> ErasedData {
        let id = EntityId::new(EntityTypeId::of::<ParentEntity>(), index);
        Arc::new(EntityData::new(id, source(entity_source), ParentEntity::new(property)))
    }

    fn modify(log: &mut ChangeLog, old: &ErasedData, new: &ErasedData, in_base: bool) {
        let references = EntityReferences::default();
        log.record_replace(Modification {
            old_data: old,
            new_data: new,
            references_before: &references,
            references_after: &references,
            in_base,
        });
    }

    #[test]
    fn test_add_then_remove_leaves_no_entry() {
        let mut log = ChangeLog::default();
        let added = data(0, "a", "test");
        log.record_add(&added);
        log.record_remove(&added);
        assert!(log.is_empty());
    }

    #[test]
    fn test_remove_after_replace_keeps_base_data() {
        let mut log = ChangeLog::default();
        let base = data(0, "base", "test");
        let changed = data(0, "changed", "test");
        modify(&mut log, &base, &changed, true);
        log.record_remove(&changed);

        let entry = log.get(base.id()).unwrap();
        assert_eq!(entry.kind(), ChangeKind::Removed);
        assert!(entry.old_data().unwrap().same_as(&*base));
    }

    #[test]
    fn test_source_change_on_unmaterialized_id_nets_to_add() {
        let mut log = ChangeLog::default();
        let old = data(4, "p", "old");
        let new = data(4, "p", "new");
        log.record_change_source(&old, &new, false);
        let entry = log.get(new.id()).unwrap();
        assert_eq!(entry.kind(), ChangeKind::Added);
        assert_eq!(entry.new_data().unwrap().entity_source(), &source("new"));
    }

    #[test]
    fn test_folding_keeps_first_touch_order() {
        let mut log = ChangeLog::default();
        let first = data(0, "first", "test");
        let second = data(1, "second", "test");
        let third = data(2, "third", "test");
        modify(&mut log, &first, &first, true);
        modify(&mut log, &second, &second, true);
        modify(&mut log, &third, &third, true);

        log.record_change_source(&first, &data(0, "first", "moved"), true);

        let ids: Vec<u32> = log.iter().map(|(id, _)| id.index).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(
            log.get(first.id()).map(ChangeEntry::kind),
            Some(ChangeKind::ReplacedAndSourceChanged)
        );
    }

    #[test]
    fn test_discard_if_unchanged_keeps_real_replacements() {
        let mut log = ChangeLog::default();
        let kept = data(0, "base", "test");
        let dropped = data(1, "base", "test");
        modify(&mut log, &kept, &data(0, "changed", "test"), true);
        modify(&mut log, &dropped, &dropped, true);

        log.discard_if_unchanged(kept.id());
        log.discard_if_unchanged(dropped.id());

        assert_eq!(log.len(), 1);
        assert!(log.get(kept.id()).is_some());
        assert!(log.get(dropped.id()).is_none());
    }

    #[test]
    #[should_panic(expected = "is removed twice")]
    fn test_double_remove_panics() {
        let mut log = ChangeLog::default();
        let base = data(0, "base", "test");
        log.record_remove(&base);
        log.record_remove(&base);
    }
}
