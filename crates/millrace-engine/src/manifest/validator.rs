//! Semantic validation for parsed manifests.

use std::collections::HashSet;

use anyhow::{bail, Result};
use millrace_types::Manifest;

/// Validate a parsed manifest.
/// Returns `Ok(())` if valid, Err listing every problem found if not.
///
/// # Errors
///
/// Returns an error listing all validation failures.
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    let mut errors = Vec::new();

    if manifest.steps.is_empty() {
        errors.push("Manifest must define at least one step".to_string());
    }

    let mut seen = HashSet::new();
    for (i, step) in manifest.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            errors.push(format!("Step {i} has an empty name"));
        } else if !seen.insert(step.name.clone()) {
            errors.push(format!("Duplicate step name '{}'", step.name));
        }

        if step.script.trim().is_empty() {
            errors.push(format!("Step '{}' has an empty script", step.name));
        }

        if step.parallel == Some(0) {
            errors.push(format!("Step '{}': parallel must be at least 1", step.name));
        }

        for input in &step.inputs {
            if input.trim().is_empty() {
                errors.push(format!("Step '{}' has an empty input name", step.name));
            }
        }
    }

    let start_count = manifest.steps.iter().filter(|s| s.start).count();
    if start_count == 0 && !manifest.steps.is_empty() {
        errors.push("Manifest has no start step".to_string());
    } else if start_count > 1 {
        errors.push(format!(
            "Manifest has {start_count} start steps; at most one is allowed"
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Invalid manifest:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_types::ManifestStep;

    fn step(name: &str, start: bool) -> ManifestStep {
        ManifestStep {
            name: name.into(),
            script: "true".into(),
            start,
            parallel: None,
            inputs: vec![],
        }
    }

    #[test]
    fn valid_manifest_passes() {
        let manifest = Manifest {
            steps: vec![step("a", true), step("b", false)],
        };
        validate_manifest(&manifest).unwrap();
    }

    #[test]
    fn empty_manifest_rejected() {
        let err = validate_manifest(&Manifest { steps: vec![] }).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn missing_start_rejected() {
        let manifest = Manifest {
            steps: vec![step("a", false)],
        };
        let err = validate_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("no start step"));
    }

    #[test]
    fn duplicate_start_rejected() {
        let manifest = Manifest {
            steps: vec![step("a", true), step("b", true)],
        };
        let err = validate_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("2 start steps"));
    }

    #[test]
    fn duplicate_names_rejected() {
        let manifest = Manifest {
            steps: vec![step("a", true), step("a", false)],
        };
        let err = validate_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("Duplicate step name 'a'"));
    }

    #[test]
    fn all_problems_reported_together() {
        let mut bad = step("", false);
        bad.script = " ".into();
        bad.parallel = Some(0);
        let err = validate_manifest(&Manifest { steps: vec![bad] })
            .unwrap_err()
            .to_string();
        assert!(err.contains("empty name"));
        assert!(err.contains("empty script"));
        assert!(err.contains("parallel must be at least 1"));
        assert!(err.contains("no start step"));
    }
}
