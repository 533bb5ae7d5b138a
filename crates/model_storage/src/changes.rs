//! Consumer-facing views of a builder's pending changes.

use indexmap::IndexMap;
use serde::Serialize;

use crate::builder::Builder;
use crate::change_log::{ChangeEntry, ChangeKind};
use crate::entity::{EntityId, EntityTypeId, ErasedData, ErasedEntityData, WorkspaceEntity};
use crate::error::StorageError;
use crate::refs::ConnectionId;
use crate::storage::EntityStorage;

/// Net change of one entity, with current data for entities that still exist.
#[derive(Debug, Clone)]
pub enum EntityChange {
    Added(ErasedData),
    Removed(ErasedData),
    Replaced { old: ErasedData, new: ErasedData },
}

impl EntityChange {
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::Added(data) | Self::Removed(data) | Self::Replaced { new: data, .. } => data.id(),
        }
    }
}

/// Changes of one entity type, removals first and additions last.
#[derive(Debug, Clone, Default)]
pub struct TypeChanges {
    pub removed: Vec<EntityChange>,
    pub replaced: Vec<EntityChange>,
    pub added: Vec<EntityChange>,
}

impl TypeChanges {
    /// All changes in apply order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityChange> {
        self.removed
            .iter()
            .chain(self.replaced.iter())
            .chain(self.added.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.removed.len() + self.replaced.len() + self.added.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pending changes grouped by entity type, in order of first change.
#[derive(Debug, Clone, Default)]
pub struct CollectedChanges {
    by_type: IndexMap<EntityTypeId, TypeChanges>,
}

impl CollectedChanges {
    #[must_use]
    pub fn of<T: WorkspaceEntity>(&self) -> Option<&TypeChanges> {
        self.by_type.get(&EntityTypeId::of::<T>())
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityTypeId, &TypeChanges)> {
        self.by_type.iter().map(|(&ty, changes)| (ty, changes))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// A reference in a [`ChangeRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceRecord {
    pub connection: &'static str,
    pub id: EntityId,
}

/// A parent reference in a [`ChangeRecord`]. `parent` is `None` when the
/// entity was detached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentRecord {
    pub connection: &'static str,
    pub parent: Option<EntityId>,
}

/// Serialisable form of one change log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub id: EntityId,
    pub entity_type: &'static str,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_children: Vec<ReferenceRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_children: Vec<ReferenceRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modified_parents: Vec<ParentRecord>,
}

fn reference_records(references: &[(ConnectionId, EntityId)]) -> Vec<ReferenceRecord> {
    references
        .iter()
        .map(|&(connection, id)| ReferenceRecord {
            connection: connection.name(),
            id,
        })
        .collect()
}

impl Builder {
    /// Group the pending changes by entity type. Replaced entries carry the
    /// data as it is now in this builder.
    #[must_use]
    pub fn collect_changes(&self) -> CollectedChanges {
        let mut collected = CollectedChanges::default();
        for (id, entry) in self.change_log().iter() {
            let changes = collected.by_type.entry(id.entity_type).or_default();
            match entry {
                ChangeEntry::AddEntity { .. } => {
                    if let Some(current) = self.entity_data(id) {
                        changes.added.push(EntityChange::Added(current));
                    }
                }
                ChangeEntry::RemoveEntity { old_data } => {
                    changes.removed.push(EntityChange::Removed(old_data.clone()));
                }
                _ => {
                    if let (Some(old), Some(new)) = (entry.old_data(), self.entity_data(id)) {
                        changes.replaced.push(EntityChange::Replaced {
                            old: old.clone(),
                            new,
                        });
                    }
                }
            }
        }
        collected
    }

    /// Serialise the pending changes, after verifying the builder is
    /// consistent.
    pub fn export_changes(&self) -> Result<Vec<ChangeRecord>, StorageError> {
        self.check_consistency()?;
        let mut records = Vec::with_capacity(self.change_log().len());
        for (id, entry) in self.change_log().iter() {
            let old = entry.old_data().map(|data| data.to_json()).transpose()?;
            let new = match entry.kind() {
                ChangeKind::Removed => None,
                _ => self.entity_data(id).map(|data| data.to_json()).transpose()?,
            };
            let entity_type = match entry.new_data().or_else(|| entry.old_data()) {
                Some(data) => data.type_name(),
                None => unreachable!("every change entry carries data"),
            };
            let mut record = ChangeRecord {
                id,
                entity_type,
                kind: entry.kind(),
                old,
                new,
                new_children: Vec::new(),
                removed_children: Vec::new(),
                modified_parents: Vec::new(),
            };
            if let Some(replace) = entry.replace() {
                record.new_children = reference_records(&replace.new_children);
                record.removed_children = reference_records(&replace.removed_children);
                record.modified_parents = replace
                    .modified_parents
                    .iter()
                    .map(|(connection, &parent)| ParentRecord {
                        connection: connection.name(),
                        parent,
                    })
                    .collect();
            }
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::test_entities::{CHILDREN, ChildEntity, ParentEntity, add_parent_entity, source};

    #[test]
    fn test_collect_changes_groups_by_kind() {
        let mut builder = Builder::new();
        let kept = add_parent_entity(&mut builder, "kept");
        let dropped = add_parent_entity(&mut builder, "dropped");
        builder.clear_change_log();

        builder.modify_entity(kept, |m| m.parent_property = "changed".into());
        builder.remove_entity(dropped);
        let added = add_parent_entity(&mut builder, "added");

        let collected = builder.collect_changes();
        let parents = collected.of::<ParentEntity>().unwrap();
        assert_eq!(parents.len(), 3);
        let order: Vec<EntityId> = parents.iter().map(EntityChange::id).collect();
        assert_eq!(order, vec![dropped.id(), kept.id(), added.id()]);
        match &parents.replaced[0] {
            EntityChange::Replaced { old, new } => {
                assert_eq!(old.typed::<ParentEntity>().unwrap().fields.parent_property, "kept");
                assert_eq!(new.typed::<ParentEntity>().unwrap().fields.parent_property, "changed");
            }
            other => panic!("expected Replaced, got {other:?}"),
        }
        assert!(collected.of::<ChildEntity>().is_none());
    }

    #[test]
    fn test_collect_changes_reports_current_data_for_source_changes() {
        let mut builder = Builder::new();
        let entity = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();
        builder.modify_entity(entity, |m| m.parent_property = "Modified".into());
        builder.change_source(entity, source("moved"));

        let collected = builder.collect_changes();
        match &collected.of::<ParentEntity>().unwrap().replaced[0] {
            EntityChange::Replaced { new, .. } => {
                assert_eq!(new.entity_source(), &source("moved"));
                assert_eq!(new.typed::<ParentEntity>().unwrap().fields.parent_property, "Modified");
            }
            other => panic!("expected Replaced, got {other:?}"),
        }
    }

    #[test]
    fn test_export_changes_serialises_entries() {
        let mut builder = Builder::new();
        let parent = add_parent_entity(&mut builder, "Parent");
        builder.clear_change_log();
        let child: EntityRef<ChildEntity> = builder.add_entity(source("test"), ChildEntity::new("child"));
        builder.modify_entity(parent, |m| {
            m.parent_property = "Modified".into();
            m.set_children(CHILDREN, [child]);
        });

        let records = builder.export_changes().unwrap();
        assert_eq!(records.len(), 2);

        let json = serde_json::to_value(&records).unwrap();
        let child_record = &json[0];
        assert_eq!(child_record["kind"], "Added");
        assert!(child_record.get("old").is_none());

        let parent_record = &json[1];
        assert_eq!(parent_record["kind"], "Replaced");
        assert_eq!(parent_record["entity_type"], "ParentEntity");
        assert_eq!(parent_record["old"]["fields"]["parent_property"], "Parent");
        assert_eq!(parent_record["new"]["fields"]["parent_property"], "Modified");
        assert_eq!(parent_record["new_children"][0]["connection"], "children");
        assert!(parent_record.get("removed_children").is_none());
    }
}
