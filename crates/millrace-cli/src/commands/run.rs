use std::path::Path;

use anyhow::{Context, Result};
use millrace_engine::manifest::parser;
use millrace_engine::{PipelineDriver, RunOptions, SinkMode};

use crate::preflight;

/// Execute the `run` command: parse the manifest, open the stores, and
/// drive the pipeline to completion.
pub async fn execute(
    db: &Path,
    manifest_path: &Path,
    parallel: Option<usize>,
    start: Option<String>,
    steps: Vec<String>,
    sink: &str,
) -> Result<()> {
    let manifest = parser::parse_manifest(manifest_path)
        .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?;
    let sink_mode: SinkMode = sink.parse().map_err(anyhow::Error::msg)?;

    preflight::check_disk_space(db);

    let driver = PipelineDriver::open(db)?;
    let defaults = RunOptions::default();
    let options = RunOptions {
        max_parallel: parallel.unwrap_or(defaults.max_parallel),
        sink_mode,
        enabled_steps: steps,
        start_step: start,
    };

    tracing::info!(
        manifest = %manifest_path.display(),
        steps = manifest.steps.len(),
        parallel = options.max_parallel,
        "Starting pipeline run"
    );

    let summary = driver.run(&manifest, &options).await?;
    let status = driver.status()?;

    println!("Pipeline run completed.");
    println!("  Tasks executed: {}", summary.tasks_executed);
    println!("  Duration:       {:.2}s", summary.duration.as_secs_f64());
    println!("  Throughput:     {:.1} tasks/sec", summary.rate());
    println!(
        "  Progress:       {}/{} tasks processed",
        status.processed_tasks, status.total_tasks
    );

    Ok(())
}
