//! Metadata store trait definition.
//!
//! [`MetaStore`] defines the storage contract for steps, resources, and
//! tasks. Model types live in [`millrace_types::model`].

use millrace_types::model::{PipelineStatus, Resource, Step, StepDef, Task};

use crate::error;

/// Storage contract for pipeline metadata.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn MetaStore>`. Every operation is atomic: single-statement or
/// wrapped in a transaction by the implementation.
pub trait MetaStore: Send + Sync {
    /// Register a step definition.
    ///
    /// If the latest version for `def.name` has identical script and
    /// inputs, its `is_start`/`parallel` flags are refreshed and its id
    /// returned; otherwise a new row is inserted with the next version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn upsert_step(&self, def: &StepDef) -> error::Result<i64>;

    /// Fetch a step row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn step_by_id(&self, id: i64) -> error::Result<Option<Step>>;

    /// The latest version registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn current_step(&self, name: &str) -> error::Result<Option<Step>>;

    /// The latest step flagged as the pipeline start.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn start_step(&self) -> error::Result<Option<Step>>;

    /// Every non-latest step version whose script or inputs differ from a
    /// newer version of the same name.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn tainted_steps(&self) -> error::Result<Vec<Step>>;

    /// Copy every task of a tainted step onto the latest version of the
    /// same name, unprocessed and error-free, preserving the input
    /// resource. Returns the number of tasks re-queued.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnknownStep`](crate::StateError::UnknownStep)
    /// if `tainted_step_id` does not exist, or any storage failure.
    fn migrate_tainted_tasks(&self, tainted_step_id: i64) -> error::Result<u64>;

    /// Upsert a `(name, object_hash)` resource pair, returning the row id.
    /// Safe under concurrent identical inserts.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn create_resource(&self, name: &str, object_hash: &str) -> error::Result<i64>;

    /// Fetch a resource row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn resource_by_id(&self, id: i64) -> error::Result<Option<Resource>>;

    /// All resources of a logical name, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn resources_by_name(&self, name: &str) -> error::Result<Vec<Resource>>;

    /// Resources of `name` not yet bound to a task of `consuming_step_id`,
    /// newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn unconsumed_resources(&self, name: &str, consuming_step_id: i64)
        -> error::Result<Vec<Resource>>;

    /// One-statement task synthesis: insert an unprocessed task for every
    /// resource matching the step's inputs that the step has not yet
    /// consumed. Returns the number inserted; idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnknownStep`](crate::StateError::UnknownStep)
    /// if `step_id` does not exist, or any storage failure.
    fn schedule_tasks_for_step(&self, step_id: i64) -> error::Result<u64>;

    /// Create the input-less seed task for a start step, unless the step
    /// already has any task. Returns the new task id, or `None` when one
    /// already existed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn create_seed_task(&self, step_id: i64) -> error::Result<Option<i64>>;

    /// Unprocessed tasks for a step, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn unprocessed_tasks(&self, step_id: i64) -> error::Result<Vec<Task>>;

    /// Mark a task processed, recording the script's error string if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn mark_processed(&self, task_id: i64, error: Option<&str>) -> error::Result<()>;

    /// Delete every task of a step (resources and blobs are retained).
    /// Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn mark_step_undone(&self, step_id: i64) -> error::Result<u64>;

    /// Reset every task of a step to unprocessed for an operator-initiated
    /// re-run. Returns the number reset.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn reset_step_tasks(&self, step_id: i64) -> error::Result<u64>;

    /// Total number of tasks bound to a step.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn count_tasks_for_step(&self, step_id: i64) -> error::Result<u64>;

    /// Total number of resource rows.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn count_resources(&self) -> error::Result<u64>;

    /// Aggregate task progress across the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn pipeline_status(&self) -> error::Result<PipelineStatus>;

    /// Force durable state (WAL checkpoint) before starting a step.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn checkpoint(&self) -> error::Result<()>;
}
