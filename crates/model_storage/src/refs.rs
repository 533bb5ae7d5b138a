//! Parent/child references between entities.
//!
//! A [`ConnectionId`] declares one reference field pair: which entity type is
//! the parent, which is the child, and whether the parent holds one child or
//! an ordered list of them. The [`RefsTable`] keeps one table per connection,
//! each behind its own `Arc` so forks share untouched connections.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::entity::{EntityId, EntityTypeId, WorkspaceEntity};

/// Whether a parent holds a list of children or at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ConnectionKind {
    OneToMany,
    OneToOne,
}

/// Declares a parent/child reference between two entity types.
///
/// ```rust
/// # use serde::Serialize;
/// # use model_storage::{ConnectionId, WorkspaceEntity};
/// # #[derive(Debug, Clone, PartialEq, Serialize)] struct ModuleEntity;
/// # impl WorkspaceEntity for ModuleEntity { const TYPE_NAME: &'static str = "ModuleEntity"; }
/// # #[derive(Debug, Clone, PartialEq, Serialize)] struct ContentRootEntity;
/// # impl WorkspaceEntity for ContentRootEntity { const TYPE_NAME: &'static str = "ContentRootEntity"; }
/// const CONTENT_ROOTS: ConnectionId =
///     ConnectionId::one_to_many::<ModuleEntity, ContentRootEntity>("contentRoots");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId {
    name: &'static str,
    parent: EntityTypeId,
    child: EntityTypeId,
    kind: ConnectionKind,
}

impl ConnectionId {
    #[must_use]
    pub const fn one_to_many<P: WorkspaceEntity, C: WorkspaceEntity>(name: &'static str) -> Self {
        Self {
            name,
            parent: EntityTypeId::of::<P>(),
            child: EntityTypeId::of::<C>(),
            kind: ConnectionKind::OneToMany,
        }
    }

    #[must_use]
    pub const fn one_to_one<P: WorkspaceEntity, C: WorkspaceEntity>(name: &'static str) -> Self {
        Self {
            name,
            parent: EntityTypeId::of::<P>(),
            child: EntityTypeId::of::<C>(),
            kind: ConnectionKind::OneToOne,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn parent_type(&self) -> EntityTypeId {
        self.parent
    }

    #[must_use]
    pub const fn child_type(&self) -> EntityTypeId {
        self.child
    }

    #[must_use]
    pub const fn kind(&self) -> ConnectionKind {
        self.kind
    }
}

/// The references one entity holds at a point in time: its children across
/// every connection where it is the parent, and its parent in every
/// connection where it is a child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EntityReferences {
    pub(crate) children: Vec<(ConnectionId, EntityId)>,
    pub(crate) parents: BTreeMap<ConnectionId, EntityId>,
}

#[derive(Debug, Clone, Default)]
struct ConnectionTable {
    children: HashMap<EntityId, Vec<EntityId>>,
    parents: HashMap<EntityId, EntityId>,
}

impl ConnectionTable {
    fn detach(&mut self, parent: EntityId, child: EntityId) {
        if let Some(list) = self.children.get_mut(&parent) {
            list.retain(|&c| c != child);
            if list.is_empty() {
                self.children.remove(&parent);
            }
        }
    }
}

/// All connection tables of one storage.
#[derive(Debug, Clone, Default)]
pub(crate) struct RefsTable {
    connections: BTreeMap<ConnectionId, Arc<ConnectionTable>>,
}

impl RefsTable {
    fn table_mut(&mut self, connection: ConnectionId) -> &mut ConnectionTable {
        Arc::make_mut(self.connections.entry(connection).or_default())
    }

    pub(crate) fn children(&self, connection: ConnectionId, parent: EntityId) -> &[EntityId] {
        self.connections
            .get(&connection)
            .and_then(|table| table.children.get(&parent))
            .map_or(&[], Vec::as_slice)
    }

    pub(crate) fn parent(&self, connection: ConnectionId, child: EntityId) -> Option<EntityId> {
        self.connections
            .get(&connection)
            .and_then(|table| table.parents.get(&child))
            .copied()
    }

    pub(crate) fn references_of(&self, id: EntityId) -> EntityReferences {
        let mut references = EntityReferences::default();
        for (&connection, table) in &self.connections {
            if connection.parent == id.entity_type {
                if let Some(children) = table.children.get(&id) {
                    references
                        .children
                        .extend(children.iter().map(|&child| (connection, child)));
                }
            }
            if connection.child == id.entity_type {
                if let Some(&parent) = table.parents.get(&id) {
                    references.parents.insert(connection, parent);
                }
            }
        }
        references
    }

    /// Replace the children list of `parent`. Returns every other entity
    /// whose references changed: detached children, newly attached
    /// children, and previous parents of children that moved.
    pub(crate) fn replace_children(
        &mut self,
        connection: ConnectionId,
        parent: EntityId,
        new_children: &[EntityId],
    ) -> Vec<EntityId> {
        let table = self.table_mut(connection);
        let old_children = table.children.remove(&parent).unwrap_or_default();
        let mut affected = Vec::new();

        for &child in &old_children {
            if !new_children.contains(&child) {
                table.parents.remove(&child);
                affected.push(child);
            }
        }
        for &child in new_children {
            match table.parents.insert(child, parent) {
                Some(previous) if previous == parent => {}
                Some(previous) => {
                    table.detach(previous, child);
                    affected.push(previous);
                    affected.push(child);
                }
                None => affected.push(child),
            }
        }
        if !new_children.is_empty() {
            table.children.insert(parent, new_children.to_vec());
        }
        affected
    }

    /// Point `child` at `parent` (or detach it). Returns every other entity
    /// whose references changed.
    pub(crate) fn set_parent(
        &mut self,
        connection: ConnectionId,
        child: EntityId,
        parent: Option<EntityId>,
    ) -> Vec<EntityId> {
        let table = self.table_mut(connection);
        let previous = table.parents.get(&child).copied();
        if previous == parent {
            return Vec::new();
        }

        let mut affected = Vec::new();
        if let Some(previous) = previous {
            table.parents.remove(&child);
            table.detach(previous, child);
            affected.push(previous);
        }
        if let Some(parent) = parent {
            if connection.kind == ConnectionKind::OneToOne {
                for other in table.children.remove(&parent).unwrap_or_default() {
                    table.parents.remove(&other);
                    affected.push(other);
                }
            }
            table.children.entry(parent).or_default().push(child);
            table.parents.insert(child, parent);
            affected.push(parent);
        }
        affected
    }

    /// Drop every reference that mentions `id`.
    pub(crate) fn remove_entity(&mut self, id: EntityId) {
        let touched: Vec<ConnectionId> = self
            .connections
            .keys()
            .filter(|c| c.parent == id.entity_type || c.child == id.entity_type)
            .copied()
            .collect();
        for connection in touched {
            let table = match self.connections.get(&connection) {
                Some(table) => table,
                None => continue,
            };
            let is_parent = table.children.contains_key(&id);
            let parent = table.parents.get(&id).copied();
            if !is_parent && parent.is_none() {
                continue;
            }
            let table = self.table_mut(connection);
            if let Some(children) = table.children.remove(&id) {
                for child in children {
                    table.parents.remove(&child);
                }
            }
            if let Some(parent) = parent {
                table.parents.remove(&id);
                table.detach(parent, id);
            }
        }
    }

    /// Collect every transitive child of `id`, children before parents.
    pub(crate) fn collect_descendants(&self, id: EntityId, accumulator: &mut Vec<EntityId>) {
        let mut visited = HashSet::from([id]);
        self.visit_descendants(id, &mut visited, accumulator);
    }

    fn visit_descendants(&self, id: EntityId, visited: &mut HashSet<EntityId>, accumulator: &mut Vec<EntityId>) {
        for (_, child) in self.references_of(id).children {
            if visited.insert(child) {
                self.visit_descendants(child, visited, accumulator);
                accumulator.push(child);
            }
        }
    }

    /// Every `(connection, parent, children)` triple, for consistency checks.
    pub(crate) fn iter_children(&self) -> impl Iterator<Item = (ConnectionId, EntityId, &[EntityId])> {
        self.connections.iter().flat_map(|(&connection, table)| {
            table
                .children
                .iter()
                .map(move |(&parent, children)| (connection, parent, children.as_slice()))
        })
    }

    /// Every `(connection, child, parent)` triple, for consistency checks.
    pub(crate) fn iter_parents(&self) -> impl Iterator<Item = (ConnectionId, EntityId, EntityId)> {
        self.connections.iter().flat_map(|(&connection, table)| {
            table
                .parents
                .iter()
                .map(move |(&child, &parent)| (connection, child, parent))
        })
    }
}
