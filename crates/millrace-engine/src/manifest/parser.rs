//! Manifest YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use millrace_types::Manifest;
use regex::Regex;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                missing.push(var_name.to_string());
            }
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result)
}

/// Parse a manifest YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if substitution fails or the YAML is invalid.
pub fn parse_manifest_str(yaml_str: &str) -> Result<Manifest> {
    let substituted = substitute_env_vars(yaml_str)?;
    let manifest: Manifest =
        serde_yaml::from_str(&substituted).context("Failed to parse manifest YAML")?;
    Ok(manifest)
}

/// Parse a manifest YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_manifest(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
    parse_manifest_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_substitution() {
        std::env::set_var("MR_TEST_TARGET", "example.com");
        let input = "script: curl ${MR_TEST_TARGET}";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "script: curl example.com");
        std::env::remove_var("MR_TEST_TARGET");
    }

    #[test]
    fn no_env_vars_passthrough() {
        let input = "steps: []";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn missing_env_vars_all_reported() {
        let input = "${MR_MISSING_X} and ${MR_MISSING_Y}";
        let err = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err.contains("MR_MISSING_X"));
        assert!(err.contains("MR_MISSING_Y"));
    }

    #[test]
    fn dollar_without_braces_left_alone() {
        // Script bodies lean on $OUTPUT_DIR at run time; only ${...} is
        // substituted at parse time.
        let input = "script: echo hi > $OUTPUT_DIR/a_1.txt";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn parse_manifest_from_string() {
        let yaml = r"
steps:
  - name: fetch
    start: true
    script: echo hello > $OUTPUT_DIR/page_1.txt
  - name: count
    inputs: [page]
    script: wc -c < $INPUT_FILE > $OUTPUT_DIR/count_1.txt
";
        let manifest = parse_manifest_str(yaml).unwrap();
        assert_eq!(manifest.steps.len(), 2);
        assert_eq!(manifest.start_step().unwrap().name, "fetch");
    }

    #[test]
    fn invalid_yaml_errors() {
        let err = parse_manifest_str("steps: {not: a list}").unwrap_err();
        assert!(err.to_string().contains("Failed to parse manifest YAML"));
    }

    #[test]
    fn missing_file_errors_with_path() {
        let err = parse_manifest(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }
}
