//! Scripted workspace session.
//!
//! Mirrors the lifecycle a host runs against the store:
//!
//! 1. Import a project into a fresh builder and attach host-side bridges.
//! 2. Freeze it and consume the import diff.
//! 3. Fork a speculative builder and apply a batch of edits to it.
//! 4. Collect and export the pending diff of the fork.
//! 5. Accept the edits by replaying the fork onto the committed builder.

use anyhow::{Result, ensure};
use model_storage::{
    Builder, ChangeRecord, EntityRef, EntitySource, EntityStorage, Snapshot, StorageConfig, StorageQuery,
};
use tracing::{debug, info};

use crate::entities::{
    CONTENT_ROOTS, ContentRootEntity, MODULE_BRIDGES, ModuleEntity, SOURCE_ROOTS, SourceRootEntity,
};

static SOURCE_ROOT_COUNT: StorageQuery<usize> =
    StorageQuery::new("source-root-count", |snapshot| snapshot.entity_count::<SourceRootEntity>());

/// Configuration for one scripted session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of modules to import.
    pub modules: usize,
    /// Settings for every builder the session creates.
    pub storage: StorageConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modules: 3,
            storage: StorageConfig::default(),
        }
    }
}

/// What the session produced.
#[derive(Debug)]
pub struct SessionReport {
    /// State right after the import.
    pub imported: Snapshot,
    /// State after the speculative edits.
    pub edited: Snapshot,
    /// Committed state after the edits were accepted.
    pub merged: Snapshot,
    /// Pending diff of the speculative builder.
    pub changes: Vec<ChangeRecord>,
}

fn import_module(builder: &mut Builder, index: usize) -> EntityRef<ModuleEntity> {
    let source = EntitySource::new(format!("modules/module-{index}.iml"));
    let base = format!("file:///workspace/module-{index}");

    let roots: Vec<EntityRef<SourceRootEntity>> = ["src", "test"]
        .into_iter()
        .map(|root_type| {
            builder.add_entity(
                source.clone(),
                SourceRootEntity {
                    url: format!("{base}/{root_type}"),
                    root_type: root_type.to_owned(),
                },
            )
        })
        .collect();
    let content_root = builder.add_entity_with(
        source.clone(),
        ContentRootEntity {
            url: base,
            excluded_patterns: vec!["*.tmp".to_owned()],
        },
        |m| {
            m.set_children(SOURCE_ROOTS, roots);
        },
    );
    builder.add_entity_with(
        source,
        ModuleEntity {
            name: format!("module-{index}"),
            module_type: Some("JAVA_MODULE".to_owned()),
        },
        |m| {
            m.set_children(CONTENT_ROOTS, [content_root]);
        },
    )
}

/// Import `config.modules` modules into a fresh builder.
pub fn import_project(config: &SessionConfig) -> (Builder, Vec<EntityRef<ModuleEntity>>) {
    let mut builder = Builder::with_config(config.storage);
    let modules: Vec<_> = (0..config.modules)
        .map(|index| import_module(&mut builder, index))
        .collect();

    let mut bridges = builder.mutable_external_mapping(MODULE_BRIDGES);
    for (bridge, module) in (1u64..).zip(&modules) {
        bridges.add_mapping(*module, bridge);
    }
    info!(
        modules = modules.len(),
        pending = builder.change_log().len(),
        "project imported"
    );
    (builder, modules)
}

/// Run the full scripted session.
pub fn run(config: &SessionConfig) -> Result<SessionReport> {
    let (mut builder, modules) = import_project(config);
    let imported = builder.to_snapshot();
    builder.clear_change_log();
    info!(
        source_roots = *imported.cached(&SOURCE_ROOT_COUNT),
        "import committed"
    );

    let mut speculative = Builder::from_builder(&builder);
    if let Some(&first) = modules.first() {
        speculative.modify_entity(first, |m| {
            m.name = format!("{}-renamed", m.name);
            m.module_type = None;
        });
        debug!(module = %first.id(), "renamed first module");
    }
    if let Some(&second) = modules.get(1) {
        speculative.change_source(second, EntitySource::new("build.gradle"));
    }
    if modules.len() > 2 {
        if let Some(&last) = modules.last() {
            let removed = speculative.remove_entity(last);
            debug!(count = removed.len(), "removed last module");
        }
    }
    let added = import_module(&mut speculative, modules.len());
    let bridge = u64::try_from(modules.len())? + 1;
    speculative
        .mutable_external_mapping(MODULE_BRIDGES)
        .add_mapping(added, bridge);

    ensure!(
        imported.entity_count::<ModuleEntity>() == modules.len(),
        "import snapshot changed under a forked builder"
    );
    ensure!(
        imported
            .external_mapping(MODULE_BRIDGES)
            .get_entities(&bridge)
            .is_empty(),
        "bridge mapping leaked into the import snapshot"
    );

    let changes = speculative.export_changes()?;
    let edited = speculative.to_snapshot();
    for (entity_type, type_changes) in speculative.collect_changes().iter() {
        info!(
            %entity_type,
            removed = type_changes.removed.len(),
            replaced = type_changes.replaced.len(),
            added = type_changes.added.len(),
            "pending changes"
        );
    }
    info!(
        entries = changes.len(),
        modifications = speculative.modification_count(),
        "speculative edits ready"
    );

    let remapped = builder.add_diff(&speculative);
    let merged = builder.to_snapshot();
    ensure!(
        merged.entity_count::<ModuleEntity>() == edited.entity_count::<ModuleEntity>(),
        "accepted edits disagree with the speculative builder"
    );
    info!(
        remapped = remapped.len(),
        pending = builder.change_log().len(),
        "speculative edits accepted"
    );

    Ok(SessionReport {
        imported,
        edited,
        merged,
        changes,
    })
}
