use std::path::Path;

use anyhow::Result;
use millrace_engine::PipelineDriver;

/// Execute the `undo` command: drop every task of the step's current
/// version. Resources and blobs stay; the next run redoes the work.
pub fn execute(db: &Path, step: &str) -> Result<()> {
    let driver = PipelineDriver::open(db)?;
    let deleted = driver.undo_step(step)?;
    println!("Deleted {deleted} task(s) for step '{step}'.");
    Ok(())
}
