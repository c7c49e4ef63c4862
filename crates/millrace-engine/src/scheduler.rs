//! Per-step scheduling: task synthesis and bounded parallel execution.
//!
//! A step runs in two phases. Phase A synthesizes tasks — one idempotent
//! insert per unconsumed input resource, plus the seed task for a start
//! step with no work yet. Phase B drains the unprocessed tasks through a
//! semaphore-bounded worker pool, each worker feeding the step's shared
//! emission channel. The loop repeats until the step is quiescent, so a
//! step whose own outputs feed it converges without outside help.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use millrace_state::{MetaStore, ObjectStore};
use millrace_types::{Step, Task};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::errors::PipelineError;
use crate::executor;
use crate::ingest::ResourceIngester;
use crate::sink::SinkMode;
use crate::wovfs::EMISSION_CAPACITY;

/// Run-wide settings the scheduler threads through to each task.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub max_parallel: usize,
    pub sink_mode: SinkMode,
    pub tmp_root: PathBuf,
}

/// Drive one step to quiescence. Returns the number of tasks executed.
///
/// # Errors
///
/// Storage, mount, and worker-panic failures abort; per-task script
/// failures are recorded on their rows and execution continues.
pub async fn run_step(
    meta: &Arc<dyn MetaStore>,
    objects: &Arc<ObjectStore>,
    step: &Step,
    ctx: &RunContext,
) -> Result<u64, PipelineError> {
    let mut executed = 0u64;

    loop {
        let synthesized = {
            let meta = meta.clone();
            let step_id = step.id;
            tokio::task::spawn_blocking(move || meta.schedule_tasks_for_step(step_id)).await??
        };
        if synthesized > 0 {
            tracing::info!(step = %step.name, tasks = synthesized, "tasks scheduled");
        }

        if step.is_start {
            let meta = meta.clone();
            let step_id = step.id;
            let seeded =
                tokio::task::spawn_blocking(move || meta.create_seed_task(step_id)).await??;
            if let Some(task_id) = seeded {
                tracing::info!(step = %step.name, task = task_id, "seed task created");
            }
        }

        let tasks = {
            let meta = meta.clone();
            let step_id = step.id;
            tokio::task::spawn_blocking(move || meta.unprocessed_tasks(step_id)).await??
        };
        if tasks.is_empty() {
            break;
        }

        executed += execute_batch(meta, objects, step, tasks, ctx).await?;
    }

    Ok(executed)
}

/// Phase B: run one collected batch of tasks under the step's
/// concurrency cap.
async fn execute_batch(
    meta: &Arc<dyn MetaStore>,
    objects: &Arc<ObjectStore>,
    step: &Step,
    tasks: Vec<Task>,
    ctx: &RunContext,
) -> Result<u64, PipelineError> {
    let parallel = step
        .parallel
        .map_or(ctx.max_parallel, |p| p as usize)
        .max(1);

    tracing::info!(
        step = %step.name,
        tasks = tasks.len(),
        parallel,
        "executing step"
    );

    let (tx, rx) = mpsc::channel(EMISSION_CAPACITY);
    let ingester = ResourceIngester::spawn(rx, objects.clone(), meta.clone());

    let semaphore = Arc::new(Semaphore::new(parallel));
    let mut workers: JoinSet<Result<(), PipelineError>> = JoinSet::new();

    for task in tasks {
        let permit = semaphore.clone().acquire_owned().await.map_err(|e| {
            PipelineError::Infrastructure(anyhow::anyhow!("worker semaphore closed: {e}"))
        })?;

        let meta = meta.clone();
        let objects = objects.clone();
        let step = step.clone();
        let tx = tx.clone();
        let ctx = ctx.clone();

        workers.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let outcome = executor::execute_task(
                &meta,
                &objects,
                &task,
                &step,
                ctx.sink_mode,
                &ctx.tmp_root,
                tx,
            )
            .await?;

            let recorded = outcome.error.clone();
            let task_id = task.id;
            let meta_for_mark = meta.clone();
            tokio::task::spawn_blocking(move || {
                meta_for_mark.mark_processed(task_id, recorded.as_deref())
            })
            .await??;

            match outcome.error {
                Some(error) => {
                    tracing::warn!(step = %step.name, task = task.id, %error, "task failed");
                }
                None => {
                    tracing::info!(
                        step = %step.name,
                        task = task.id,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "task completed"
                    );
                }
            }
            Ok(())
        });
    }
    drop(tx);

    let mut completed = 0u64;
    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => completed += 1,
            Ok(Err(error)) => {
                tracing::error!(step = %step.name, "worker failed: {error}");
                if first_error.is_none() {
                    first_error = Some(error);
                    workers.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {
                // Siblings cancelled after the first fatal error.
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(PipelineError::Infrastructure(anyhow::anyhow!(
                        "task worker panicked: {join_err}"
                    )));
                    workers.abort_all();
                }
            }
        }
    }

    // The batch isn't done until everything the scripts wrote is durable.
    let ingested = tokio::task::spawn_blocking(move || ingester.join()).await??;
    if ingested > 0 {
        tracing::debug!(step = %step.name, emissions = ingested, "batch ingested");
    }

    if let Some(error) = first_error {
        return Err(error);
    }
    Ok(completed)
}
