//! Replaying another builder's pending changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use super::{Builder, RefOp};
use crate::change_log::{ChangeEntry, ReplaceEntity};
use crate::entity::{EntityId, EntitySource};
use crate::family::{ErasedMutableFamily, FamilyLookup};
use crate::refs::{ConnectionId, ConnectionKind, EntityReferences};
use crate::storage::EntityStorage;

/// Ids of the entities a diff added, keyed by their id in the diff.
type AddedIds = IndexMap<EntityId, EntityId>;

fn remap(added: &AddedIds, id: EntityId) -> EntityId {
    added.get(&id).copied().unwrap_or(id)
}

impl Builder {
    /// Replay the change log of `diff` on top of this builder.
    ///
    /// `diff` is expected to be forked from a state this builder also
    /// contains, so that entities it replaces or removes have the same ids
    /// here. Entities the diff added get fresh ids in this builder, and the
    /// returned map translates diff ids to them. Changes to entities that
    /// no longer exist here are skipped, as are references to them.
    ///
    /// Fields of replaced entities are only overwritten when the diff
    /// changed them, so concurrent field edits here survive reference-only
    /// changes from the diff. External mappings are merged the same way.
    pub fn add_diff(&mut self, diff: &Builder) -> IndexMap<EntityId, EntityId> {
        debug!(entries = diff.change_log.len(), "replaying diff");
        let mut added = AddedIds::new();
        for (id, entry) in diff.change_log.iter() {
            let ChangeEntry::AddEntity { data } = entry else {
                continue;
            };
            let template = match diff.barrel.erased(id.entity_type) {
                Some(family) => family,
                None => unreachable!("{id} is logged as added but has no family"),
            };
            let new_id = self.barrel.family_like(template).add_erased(&**data);
            added.insert(id, new_id);
            self.register_added(new_id);
        }

        for (id, entry) in diff.change_log.iter() {
            match entry {
                ChangeEntry::AddEntity { .. } => {
                    let new_id = remap(&added, id);
                    if self.contains(new_id) {
                        self.restore_references(new_id, &diff.refs.references_of(id), &added);
                    }
                }
                ChangeEntry::RemoveEntity { .. } => {}
                ChangeEntry::ReplaceEntity(replace) => self.replay_replace(id, replace, &added),
                ChangeEntry::ChangeEntitySource(change) => {
                    self.replay_source(id, change.new_data.entity_source());
                }
                ChangeEntry::ReplaceAndChangeSource {
                    data_change,
                    source_change,
                } => {
                    self.replay_replace(id, data_change, &added);
                    self.replay_source(id, source_change.new_data.entity_source());
                }
            }
        }

        for (id, entry) in diff.change_log.iter() {
            if matches!(entry, ChangeEntry::RemoveEntity { .. }) && self.contains(id) {
                self.remove_cascade(id);
            }
        }

        self.merge_mappings(diff, &added);
        self.finish_mutation();
        info!(
            entries = diff.change_log.len(),
            added = added.len(),
            pending = self.change_log.len(),
            "diff replayed"
        );
        added
    }

    /// `id` translated into this builder, if the entity exists here.
    fn remapped(&self, id: EntityId, added: &AddedIds) -> Option<EntityId> {
        let id = remap(added, id);
        self.contains(id).then_some(id)
    }

    fn restore_references(&mut self, id: EntityId, references: &EntityReferences, added: &AddedIds) {
        let mut children: IndexMap<ConnectionId, Vec<EntityId>> = IndexMap::new();
        for &(connection, child) in &references.children {
            if let Some(child) = self.remapped(child, added) {
                children.entry(connection).or_default().push(child);
            }
        }
        let mut ops: Vec<RefOp> = children
            .into_iter()
            .map(|(connection, children)| RefOp::Children {
                connection,
                children,
            })
            .collect();
        for (&connection, &parent) in &references.parents {
            if let Some(parent) = self.remapped(parent, added) {
                ops.push(RefOp::Parent {
                    connection,
                    parent: Some(parent),
                });
            }
        }
        if !ops.is_empty() {
            self.modify_with(id, |_| ops);
        }
    }

    fn replay_replace(&mut self, id: EntityId, replace: &ReplaceEntity, added: &AddedIds) {
        if !self.contains(id) {
            debug!(%id, "skipping replace of an entity missing here");
            return;
        }
        let fields_changed = !replace.old_data.same_as(&*replace.new_data);
        let new_data = Arc::clone(&replace.new_data);
        self.modify_with(id, |builder| {
            if fields_changed {
                if let Some(family) = builder.barrel.erased_mut(id.entity_type) {
                    family.set_fields_erased(id.index, &*new_data);
                }
            }
            builder.reference_delta(id, replace, added)
        });
    }

    /// Reference updates that carry the children and parent changes of
    /// `replace` over to this builder's current references of `id`.
    fn reference_delta(&self, id: EntityId, replace: &ReplaceEntity, added: &AddedIds) -> Vec<RefOp> {
        let mut ops = Vec::new();
        let connections: BTreeSet<ConnectionId> = replace
            .new_children
            .iter()
            .chain(&replace.removed_children)
            .map(|&(connection, _)| connection)
            .collect();
        for connection in connections {
            let removed: Vec<EntityId> = replace
                .removed_children
                .iter()
                .filter(|(c, _)| *c == connection)
                .map(|&(_, child)| child)
                .collect();
            let mut children: Vec<EntityId> = self
                .refs
                .children(connection, id)
                .iter()
                .copied()
                .filter(|child| !removed.contains(child))
                .collect();
            for &(c, child) in &replace.new_children {
                if c != connection {
                    continue;
                }
                if let Some(child) = self.remapped(child, added) {
                    if !children.contains(&child) {
                        children.push(child);
                    }
                }
            }
            if connection.kind() == ConnectionKind::OneToOne && children.len() > 1 {
                children = children.split_off(children.len() - 1);
            }
            ops.push(RefOp::Children {
                connection,
                children,
            });
        }
        for (&connection, &parent) in &replace.modified_parents {
            match parent {
                None => ops.push(RefOp::Parent {
                    connection,
                    parent: None,
                }),
                Some(parent) => {
                    if let Some(parent) = self.remapped(parent, added) {
                        ops.push(RefOp::Parent {
                            connection,
                            parent: Some(parent),
                        });
                    }
                }
            }
        }
        ops
    }

    fn replay_source(&mut self, id: EntityId, entity_source: &EntitySource) {
        if self.contains(id) {
            self.set_source(id, entity_source.clone());
        } else {
            debug!(%id, "skipping source change of an entity missing here");
        }
    }

    fn merge_mappings(&mut self, diff: &Builder, added: &AddedIds) {
        let base = diff.original.indexes();
        let families: &dyn FamilyLookup = &self.barrel;
        let mut remap_existing = |id: EntityId| {
            let id = remap(added, id);
            families.contains(id).then_some(id)
        };
        for name in diff.indexes.mapping_names() {
            let Some(changed) = diff.indexes.mapping(name) else {
                continue;
            };
            let before = base.mapping(name);
            if before.is_some_and(|before| Arc::ptr_eq(before, changed)) {
                continue;
            }
            debug!(mapping = name, "merging external mapping");
            self.indexes
                .merge_mapping(name, &**changed, before.map(|before| &**before), &mut remap_existing);
        }
        for name in base.mapping_names() {
            if diff.indexes.mapping(name).is_none() {
                self.indexes.remove_mapping(name);
            }
        }
    }
}
