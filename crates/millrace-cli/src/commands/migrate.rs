use std::path::Path;

use anyhow::{Context, Result};
use millrace_engine::manifest::parser;
use millrace_engine::PipelineDriver;

/// Execute the `migrate-tainted` command.
pub fn execute(db: &Path, manifest_path: Option<&Path>) -> Result<()> {
    let manifest = manifest_path
        .map(|path| {
            parser::parse_manifest(path)
                .with_context(|| format!("Failed to parse manifest: {}", path.display()))
        })
        .transpose()?;

    let driver = PipelineDriver::open(db)?;
    let migrated = driver.migrate_tainted(manifest.as_ref())?;

    if migrated == 0 {
        println!("No tainted tasks to migrate.");
    } else {
        println!("Re-queued {migrated} task(s) onto current step versions; run again to execute them.");
    }
    Ok(())
}
