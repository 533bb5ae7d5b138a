//! Cross-checks between families, references and indexes.

use crate::entity::{EntityId, ErasedEntityData};
use crate::error::ConsistencyError;
use crate::external::ErasedMappingTable;
use crate::family::ErasedFamily;
use crate::refs::ConnectionId;
use crate::storage::StorageParts;

pub(crate) fn check(parts: StorageParts<'_>) -> Result<(), ConsistencyError> {
    check_children(parts)?;
    check_parents(parts)?;
    check_indexes(parts)?;
    check_mappings(parts)
}

fn check_type(connection: ConnectionId, id: EntityId, parent_side: bool) -> Result<(), ConsistencyError> {
    let expected = if parent_side {
        connection.parent_type()
    } else {
        connection.child_type()
    };
    if id.entity_type == expected {
        Ok(())
    } else {
        Err(ConsistencyError::WrongEntityType {
            connection: connection.name(),
            id,
        })
    }
}

fn check_children(parts: StorageParts<'_>) -> Result<(), ConsistencyError> {
    for (connection, parent, children) in parts.refs.iter_children() {
        check_type(connection, parent, true)?;
        for &child in children {
            check_type(connection, child, false)?;
            if !parts.families.contains(parent) {
                return Err(ConsistencyError::DanglingParent {
                    connection: connection.name(),
                    child,
                    parent,
                });
            }
            if !parts.families.contains(child) {
                return Err(ConsistencyError::DanglingChild {
                    connection: connection.name(),
                    parent,
                    child,
                });
            }
            if parts.refs.parent(connection, child) != Some(parent) {
                return Err(ConsistencyError::BrokenBackReference {
                    connection: connection.name(),
                    parent,
                    child,
                });
            }
        }
    }
    Ok(())
}

fn check_parents(parts: StorageParts<'_>) -> Result<(), ConsistencyError> {
    for (connection, child, parent) in parts.refs.iter_parents() {
        if !parts.families.contains(child) {
            return Err(ConsistencyError::DanglingChild {
                connection: connection.name(),
                parent,
                child,
            });
        }
        if !parts.families.contains(parent) {
            return Err(ConsistencyError::DanglingParent {
                connection: connection.name(),
                child,
                parent,
            });
        }
        if !parts.refs.children(connection, parent).contains(&child) {
            return Err(ConsistencyError::BrokenBackReference {
                connection: connection.name(),
                parent,
                child,
            });
        }
    }
    Ok(())
}

fn check_indexes(parts: StorageParts<'_>) -> Result<(), ConsistencyError> {
    for (source, ids) in parts.indexes.source_entries() {
        for &id in ids {
            let indexed_correctly = parts
                .families
                .erased_data(id)
                .is_some_and(|data| data.entity_source() == source);
            if !indexed_correctly {
                return Err(ConsistencyError::SourceIndexMismatch(id));
            }
        }
    }

    for entity_type in parts.families.entity_types() {
        let Some(family) = parts.families.family(entity_type) else {
            continue;
        };
        for id in family.ids() {
            let Some(data) = family.erased_data(id.index) else {
                continue;
            };
            if !parts.indexes.source_contains(data.entity_source(), id) {
                return Err(ConsistencyError::SourceIndexMismatch(id));
            }
            if let Some(symbolic_id) = data.symbolic_id() {
                if parts.indexes.resolve_symbolic(&symbolic_id) != Some(id) {
                    return Err(ConsistencyError::SymbolicIndexMismatch(symbolic_id, id));
                }
            }
        }
    }

    for (symbolic_id, &id) in parts.indexes.symbolic_entries() {
        let matches = parts
            .families
            .erased_data(id)
            .and_then(|data| data.symbolic_id())
            .is_some_and(|actual| &actual == symbolic_id);
        if !matches {
            return Err(ConsistencyError::SymbolicIndexMismatch(symbolic_id.clone(), id));
        }
    }
    Ok(())
}

fn check_mappings(parts: StorageParts<'_>) -> Result<(), ConsistencyError> {
    for mapping in parts.indexes.mapping_names() {
        let Some(table) = parts.indexes.mapping(mapping) else {
            continue;
        };
        if let Some(id) = table
            .entity_ids()
            .into_iter()
            .find(|&id| !parts.families.contains(id))
        {
            return Err(ConsistencyError::DanglingMapping { mapping, id });
        }
    }
    Ok(())
}
