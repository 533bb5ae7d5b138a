//! # model_app: Session driver
//!
//! Runs a scripted workspace session against the entity store and reports
//! the pending diff of a speculative edit.
//!
//! ## Session
//!
//! 1. Import `--modules` modules, each with one content root and two source
//!    roots, and bind every module to a host-side bridge id.
//! 2. Freeze the import and clear its change log.
//! 3. Fork, rename one module, move another to a new source, remove a
//!    third and import a fresh one.
//! 4. Export the net changes, as JSON with `--json`.
//! 5. Replay the fork onto the committed builder.
//!
//! Set `WORKSPACE_MODEL_STRICT=1` or pass `--strict` to verify consistency
//! after every mutation.

mod entities;
mod session;

use anyhow::Result;
use clap::Parser;
use model_storage::{EntityStorage, StorageConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use entities::ModuleEntity;
use session::SessionConfig;

#[derive(Parser, Debug)]
#[command(name = "model_app", about = "Scripted workspace model session")]
struct Args {
    /// Number of modules to import.
    #[arg(short, long, default_value_t = 3)]
    modules: usize,

    /// Check consistency after every mutation.
    #[arg(long)]
    strict: bool,

    /// Print the exported changes as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("model_app=info".parse()?))
        .init();

    let args = Args::parse();
    let env = StorageConfig::from_env();
    let config = SessionConfig {
        modules: args.modules,
        storage: env.with_strict_consistency(args.strict || env.strict_consistency),
    };
    info!(
        modules = config.modules,
        strict = config.storage.strict_consistency,
        "session starting"
    );

    let report = session::run(&config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.changes)?);
    } else {
        for change in &report.changes {
            info!(id = %change.id, entity_type = change.entity_type, kind = ?change.kind, "change");
        }
    }

    info!(
        modules_before = report.imported.entity_count::<ModuleEntity>(),
        modules_after = report.edited.entity_count::<ModuleEntity>(),
        modules_merged = report.merged.entity_count::<ModuleEntity>(),
        "session finished"
    );
    Ok(())
}
