//! Persistent entities and the transient file emission record.
//!
//! Three rows live in the metadata store: [`Step`], [`Resource`], [`Task`].
//! [`FileEmission`] is transient — produced when a script closes an output
//! file, consumed exactly once by the resource ingester, never persisted
//! (the durable artifact is the object-store blob plus a `Resource` row).

use serde::{Deserialize, Serialize};

/// A versioned step row: a named shell script plus the logical resource
/// names it consumes.
///
/// A new version is inserted whenever `(script, inputs)` changes for a
/// name; only `is_start` and `parallel` of the latest version are ever
/// updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub name: String,
    pub script: String,
    pub is_start: bool,
    /// Per-step cap on concurrent executions; `None` defers to the
    /// run-wide maximum.
    pub parallel: Option<u32>,
    /// Logical resource names this step consumes, in manifest order.
    pub inputs: Vec<String>,
    pub version: i64,
}

/// The insertable portion of a step, as declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDef {
    pub name: String,
    pub script: String,
    pub is_start: bool,
    pub parallel: Option<u32>,
    pub inputs: Vec<String>,
}

/// A named, content-addressed artifact. Insert-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    /// Logical stream name derived from the emitting file's basename.
    pub name: String,
    /// SHA-256 of the payload, lowercase hex.
    pub object_hash: String,
    pub created_at: String,
}

/// The binding of a step to one input resource: one pending or completed
/// execution.
///
/// `input_resource_id` is `None` only for the seed task of a start step.
/// `error` carries the script's failure string when execution failed; a
/// failed task still counts as processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub step_id: i64,
    pub input_resource_id: Option<i64>,
    pub processed: bool,
    pub error: Option<String>,
}

/// One completed output file captured from a script, on its way to the
/// ingester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEmission {
    /// Basename exactly as the script wrote it.
    pub name: String,
    pub payload: Vec<u8>,
}

/// Aggregate progress over every task in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub total_tasks: u64,
    pub processed_tasks: u64,
}

impl PipelineStatus {
    /// A pipeline is complete once it has work and all of it is processed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total_tasks > 0 && self.total_tasks == self.processed_tasks
    }
}

impl Step {
    /// The definition this row was inserted from.
    #[must_use]
    pub fn def(&self) -> StepDef {
        StepDef {
            name: self.name.clone(),
            script: self.script.clone(),
            is_start: self.is_start,
            parallel: self.parallel,
            inputs: self.inputs.clone(),
        }
    }
}

impl Task {
    /// Seed tasks bootstrap a fresh pipeline and carry no input resource.
    #[must_use]
    pub fn is_seed(&self) -> bool {
        self.input_resource_id.is_none()
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} (step {}, input {})",
            self.id,
            self.step_id,
            self.input_resource_id
                .map_or_else(|| "seed".to_string(), |id| id.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_task_has_no_input() {
        let t = Task {
            id: 1,
            step_id: 7,
            input_resource_id: None,
            processed: false,
            error: None,
        };
        assert!(t.is_seed());
        assert_eq!(t.to_string(), "task 1 (step 7, input seed)");
    }

    #[test]
    fn bound_task_displays_input_id() {
        let t = Task {
            id: 2,
            step_id: 7,
            input_resource_id: Some(42),
            processed: true,
            error: Some("exit status 1".into()),
        };
        assert!(!t.is_seed());
        assert_eq!(t.to_string(), "task 2 (step 7, input 42)");
    }

    #[test]
    fn status_completeness() {
        assert!(!PipelineStatus {
            total_tasks: 0,
            processed_tasks: 0
        }
        .is_complete());
        assert!(!PipelineStatus {
            total_tasks: 3,
            processed_tasks: 2
        }
        .is_complete());
        assert!(PipelineStatus {
            total_tasks: 3,
            processed_tasks: 3
        }
        .is_complete());
    }

    #[test]
    fn step_def_roundtrip() {
        let step = Step {
            id: 9,
            name: "fetch".into(),
            script: "curl example.com > $OUTPUT_DIR/page_1.html".into(),
            is_start: true,
            parallel: Some(4),
            inputs: vec![],
            version: 2,
        };
        let def = step.def();
        assert_eq!(def.name, "fetch");
        assert_eq!(def.parallel, Some(4));
        assert!(def.is_start);
    }
}
