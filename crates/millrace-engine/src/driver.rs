//! Run driver: manifest registration, pass loop, taint migration.
//!
//! One [`PipelineDriver`] owns the stores for a pipeline directory. A run
//! upserts the manifest's steps, then sweeps the enabled steps in
//! manifest order until a full pass executes nothing — one pass suffices
//! for acyclic manifests, and name-graph cycles converge because
//! content-addressed dedup stops re-emission of identical artifacts.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use millrace_state::{MetaStore, ObjectStore, SqliteMetaStore};
use millrace_types::{Manifest, PipelineStatus, Step};

use crate::errors::PipelineError;
use crate::manifest::validate_manifest;
use crate::scheduler::{self, RunContext};
use crate::sink::SinkMode;

/// Settings for one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Fallback concurrency for steps without their own `parallel` cap.
    pub max_parallel: usize,
    pub sink_mode: SinkMode,
    /// Restrict the run to these step names; empty means every step.
    pub enabled_steps: Vec<String>,
    /// Re-run this step: its tasks are reset to unprocessed first.
    pub start_step: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
            sink_mode: SinkMode::default(),
            enabled_steps: Vec::new(),
            start_step: None,
        }
    }
}

/// What a completed run did.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub tasks_executed: u64,
    pub duration: Duration,
}

impl RunSummary {
    /// Average tasks per second over the run.
    #[must_use]
    pub fn rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            {
                self.tasks_executed as f64 / secs
            }
        } else {
            0.0
        }
    }
}

/// Owns the stores for one pipeline directory and drives runs against
/// them.
pub struct PipelineDriver {
    meta: Arc<dyn MetaStore>,
    objects: Arc<ObjectStore>,
    tmp_root: std::path::PathBuf,
}

impl PipelineDriver {
    /// Open (or initialize) the pipeline directory at `root`: metadata
    /// database, object store, and transient staging space.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Storage`] when either store can't be opened.
    pub fn open(root: &Path) -> Result<Self, PipelineError> {
        let meta = SqliteMetaStore::open(&root.join("meta.db"))?;
        let objects = ObjectStore::open(root)?;
        Ok(Self {
            meta: Arc::new(meta),
            objects: Arc::new(objects),
            tmp_root: root.join("tmp"),
        })
    }

    /// Build a driver over existing store handles (used by tests).
    #[must_use]
    pub fn new(
        meta: Arc<dyn MetaStore>,
        objects: Arc<ObjectStore>,
        tmp_root: std::path::PathBuf,
    ) -> Self {
        Self {
            meta,
            objects,
            tmp_root,
        }
    }

    /// The metadata store behind this pipeline (export/status surface).
    #[must_use]
    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    /// The object store behind this pipeline.
    #[must_use]
    pub fn objects(&self) -> &Arc<ObjectStore> {
        &self.objects
    }

    /// Validate the manifest and upsert its steps, returning the current
    /// rows in manifest order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] for an invalid manifest,
    /// [`PipelineError::Storage`] on store failure.
    pub fn register_manifest(&self, manifest: &Manifest) -> Result<Vec<Step>, PipelineError> {
        validate_manifest(manifest).map_err(|e| PipelineError::Config(e.to_string()))?;

        let mut steps = Vec::with_capacity(manifest.steps.len());
        for declared in &manifest.steps {
            let id = self.meta.upsert_step(&declared.to_def())?;
            let step = self.meta.step_by_id(id)?.ok_or_else(|| {
                PipelineError::Infrastructure(anyhow::anyhow!("step {id} vanished after upsert"))
            })?;
            tracing::info!(
                step = %step.name,
                version = step.version,
                start = step.is_start,
                "step registered"
            );
            steps.push(step);
        }
        Ok(steps)
    }

    /// Execute the pipeline to completion.
    ///
    /// # Errors
    ///
    /// Configuration, storage, mount, and worker-panic failures abort the
    /// run; script failures do not.
    pub async fn run(
        &self,
        manifest: &Manifest,
        options: &RunOptions,
    ) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();

        let steps = {
            let manifest = manifest.clone();
            let this = self.clone_handles();
            tokio::task::spawn_blocking(move || this.register_manifest(&manifest)).await??
        };

        let enabled: Vec<Step> = if options.enabled_steps.is_empty() {
            steps
        } else {
            steps
                .into_iter()
                .filter(|s| options.enabled_steps.iter().any(|n| n == &s.name))
                .collect()
        };
        if enabled.is_empty() {
            return Err(PipelineError::Config(
                "no enabled steps match the manifest".to_string(),
            ));
        }

        if let Some(name) = &options.start_step {
            self.reset_for_rerun(&enabled, name).await?;
        }

        let ctx = RunContext {
            max_parallel: options.max_parallel.max(1),
            sink_mode: options.sink_mode,
            tmp_root: self.tmp_root.clone(),
        };

        let mut total = 0u64;
        loop {
            let mut pass = 0u64;
            for step in &enabled {
                // Durable state before each step: interrupted runs resume
                // from the last completed task.
                {
                    let meta = self.meta.clone();
                    tokio::task::spawn_blocking(move || meta.checkpoint()).await??;
                }
                pass += scheduler::run_step(&self.meta, &self.objects, step, &ctx).await?;
            }
            total += pass;
            if pass == 0 {
                break;
            }
            tracing::debug!(executed = pass, "pass complete, re-scheduling");
        }

        let summary = RunSummary {
            tasks_executed: total,
            duration: started.elapsed(),
        };
        tracing::info!(
            tasks = summary.tasks_executed,
            duration_secs = summary.duration.as_secs_f64(),
            "pipeline run complete"
        );
        Ok(summary)
    }

    /// Operator re-run of one step: reset its tasks, or seed it if it has
    /// none.
    async fn reset_for_rerun(&self, enabled: &[Step], name: &str) -> Result<(), PipelineError> {
        let step = enabled
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                PipelineError::Config(format!("start step '{name}' is not an enabled step"))
            })?
            .clone();

        let meta = self.meta.clone();
        let reset = tokio::task::spawn_blocking(move || -> Result<u64, PipelineError> {
            let reset = meta.reset_step_tasks(step.id)?;
            if reset == 0 {
                meta.create_seed_task(step.id)?;
            }
            Ok(reset)
        })
        .await??;

        if reset > 0 {
            tracing::info!(step = name, tasks = reset, "step tasks reset for re-run");
        } else {
            tracing::info!(step = name, "no existing tasks; step seeded");
        }
        Ok(())
    }

    /// Move every tainted step's tasks onto the current version of the
    /// same name. Upserts `manifest` first when given, so the target
    /// version exists. Returns the number of tasks re-queued.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] for an invalid manifest,
    /// [`PipelineError::Storage`] on store failure.
    pub fn migrate_tainted(&self, manifest: Option<&Manifest>) -> Result<u64, PipelineError> {
        if let Some(manifest) = manifest {
            self.register_manifest(manifest)?;
        }

        let mut migrated = 0u64;
        for step in self.meta.tainted_steps()? {
            let requeued = self.meta.migrate_tainted_tasks(step.id)?;
            tracing::info!(
                step = %step.name,
                version = step.version,
                requeued,
                "tainted step migrated"
            );
            migrated += requeued;
        }
        Ok(migrated)
    }

    /// Delete every task of a step's current version.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] for an unknown step name,
    /// [`PipelineError::Storage`] on store failure.
    pub fn undo_step(&self, name: &str) -> Result<u64, PipelineError> {
        let step = self
            .meta
            .current_step(name)?
            .ok_or_else(|| PipelineError::Config(format!("unknown step '{name}'")))?;
        Ok(self.meta.mark_step_undone(step.id)?)
    }

    /// Aggregate task progress.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Storage`] on store failure.
    pub fn status(&self) -> Result<PipelineStatus, PipelineError> {
        Ok(self.meta.pipeline_status()?)
    }

    fn clone_handles(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            objects: self.objects.clone(),
            tmp_root: self.tmp_root.clone(),
        }
    }
}
