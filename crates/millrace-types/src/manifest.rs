//! Manifest document types.
//!
//! A manifest is a YAML document with an ordered `steps` array. Parsing
//! and semantic validation live in the engine crate; these are the plain
//! serde shapes.

use serde::{Deserialize, Serialize};

use crate::model::StepDef;

/// A parsed pipeline manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub steps: Vec<ManifestStep>,
}

/// One step record as declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStep {
    /// Logical step identifier; used for resource routing and versioning.
    pub name: String,
    /// Shell source executed under `sh -c`.
    pub script: String,
    /// Marks the step as the pipeline seed; at most one per manifest.
    #[serde(default)]
    pub start: bool,
    /// Maximum concurrent executions of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<u32>,
    /// Logical resource names this step consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

impl ManifestStep {
    /// The storable definition of this step.
    #[must_use]
    pub fn to_def(&self) -> StepDef {
        StepDef {
            name: self.name.clone(),
            script: self.script.clone(),
            is_start: self.start,
            parallel: self.parallel,
            inputs: self.inputs.clone(),
        }
    }
}

impl Manifest {
    /// The step flagged `start`, if any.
    #[must_use]
    pub fn start_step(&self) -> Option<&ManifestStep> {
        self.steps.iter().find(|s| s.start)
    }
}
