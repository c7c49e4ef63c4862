use std::io::Write;
use std::path::Path;

use anyhow::{bail, Result};
use millrace_engine::PipelineDriver;
use millrace_state::MetaStore;

/// Execute the `export` command: list resources by name, or stream one
/// blob to stdout by hash.
pub fn execute(db: &Path, name: Option<String>, hash: Option<String>) -> Result<()> {
    let driver = PipelineDriver::open(db)?;

    match (name, hash) {
        (Some(name), None) => {
            let rows = driver.meta().resources_by_name(&name)?;
            if rows.is_empty() {
                tracing::warn!(resource = %name, "no resources under this name");
            }
            for resource in rows {
                println!(
                    "{}  {}  {}",
                    resource.object_hash, resource.name, resource.created_at
                );
            }
        }
        (None, Some(hash)) => {
            let bytes = driver.objects().get(&hash)?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
        _ => bail!("export requires exactly one of --name or --hash"),
    }
    Ok(())
}
