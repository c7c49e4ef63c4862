use std::path::Path;

use anyhow::{bail, Result};
use millrace_engine::PipelineDriver;
use millrace_state::MetaStore;

/// Execute the `status` command.
pub fn execute(db: &Path, step: Option<&str>) -> Result<()> {
    let driver = PipelineDriver::open(db)?;

    if let Some(name) = step {
        return step_status(&driver, name);
    }

    let status = driver.status()?;
    let resources = driver.meta().count_resources()?;

    println!(
        "Tasks:     {}/{} processed",
        status.processed_tasks, status.total_tasks
    );
    println!("Resources: {resources}");
    println!(
        "State:     {}",
        if status.is_complete() {
            "complete"
        } else if status.total_tasks == 0 {
            "empty"
        } else {
            "in progress"
        }
    );
    Ok(())
}

/// Per-step detail: task progress plus, for each declared input, the
/// resources the step has not yet been scheduled against.
fn step_status(driver: &PipelineDriver, name: &str) -> Result<()> {
    let Some(step) = driver.meta().current_step(name)? else {
        bail!("unknown step '{name}'");
    };
    let total = driver.meta().count_tasks_for_step(step.id)?;
    let pending = driver.meta().unprocessed_tasks(step.id)?.len() as u64;

    println!("Step '{}' (version {})", step.name, step.version);
    println!("  Tasks:  {}/{} processed", total - pending, total);
    if step.inputs.is_empty() {
        println!("  Inputs: (none)");
    } else {
        for input in &step.inputs {
            let waiting = driver.meta().unconsumed_resources(input, step.id)?.len();
            println!("  Input '{input}': {waiting} resource(s) awaiting scheduling");
        }
    }
    Ok(())
}
