//! Sample workspace schema driven by the session.

use model_storage::{ConnectionId, ExternalMappingKey, WorkspaceEntity};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleEntity {
    pub name: String,
    pub module_type: Option<String>,
}

impl WorkspaceEntity for ModuleEntity {
    const TYPE_NAME: &'static str = "ModuleEntity";

    fn symbolic_name(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRootEntity {
    pub url: String,
    pub excluded_patterns: Vec<String>,
}

impl WorkspaceEntity for ContentRootEntity {
    const TYPE_NAME: &'static str = "ContentRootEntity";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRootEntity {
    pub url: String,
    pub root_type: String,
}

impl WorkspaceEntity for SourceRootEntity {
    const TYPE_NAME: &'static str = "SourceRootEntity";
}

pub const CONTENT_ROOTS: ConnectionId =
    ConnectionId::one_to_many::<ModuleEntity, ContentRootEntity>("contentRoots");
pub const SOURCE_ROOTS: ConnectionId =
    ConnectionId::one_to_many::<ContentRootEntity, SourceRootEntity>("sourceRoots");

/// Maps each module to the id of the host-side object that mirrors it.
pub const MODULE_BRIDGES: ExternalMappingKey<u64> = ExternalMappingKey::new("module.bridges");
