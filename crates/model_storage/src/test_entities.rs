//! Entity types shared by the unit tests.

use serde::Serialize;

use crate::builder::Builder;
use crate::entity::{EntityRef, EntitySource, WorkspaceEntity};
use crate::refs::ConnectionId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentEntity {
    pub parent_property: String,
}

impl ParentEntity {
    pub fn new(parent_property: &str) -> Self {
        Self {
            parent_property: parent_property.to_owned(),
        }
    }
}

impl WorkspaceEntity for ParentEntity {
    const TYPE_NAME: &'static str = "ParentEntity";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildEntity {
    pub child_property: String,
}

impl ChildEntity {
    pub fn new(child_property: &str) -> Self {
        Self {
            child_property: child_property.to_owned(),
        }
    }
}

impl WorkspaceEntity for ChildEntity {
    const TYPE_NAME: &'static str = "ChildEntity";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedEntity {
    pub name: String,
}

impl NamedEntity {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl WorkspaceEntity for NamedEntity {
    const TYPE_NAME: &'static str = "NamedEntity";

    fn symbolic_name(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

pub const CHILDREN: ConnectionId = ConnectionId::one_to_many::<ParentEntity, ChildEntity>("children");
pub const PRIMARY_CHILD: ConnectionId =
    ConnectionId::one_to_one::<ParentEntity, ChildEntity>("primaryChild");
pub const SUB_ENTITIES: ConnectionId = ConnectionId::one_to_many::<NamedEntity, NamedEntity>("subEntities");

pub fn source(name: &str) -> EntitySource {
    EntitySource::new(name)
}

pub fn add_parent_entity(builder: &mut Builder, parent_property: &str) -> EntityRef<ParentEntity> {
    builder.add_entity(source("test"), ParentEntity::new(parent_property))
}
