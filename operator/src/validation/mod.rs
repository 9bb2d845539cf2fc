//! Spec validation performed once, on entry into the `Pending` phase.

use validator_types::{ValidationJobSpec, reasons};

/// Env vars the execution tool consumes directly; a user `env`/`envFrom` entry
/// must not collide with these.
pub const RESERVED_ENV_VARS: &[&str] = &[
    "NOTEBOOK_INPUT_PATH",
    "NOTEBOOK_OUTPUT_PATH",
    "NOTEBOOK_RESULTS_PATH",
    "NOTEBOOK_GOLDEN_PATH",
];

pub struct ValidationError {
    pub reason: &'static str,
    pub message: String,
}

fn err(reason: &'static str, message: impl Into<String>) -> ValidationError {
    ValidationError {
        reason,
        message: message.into(),
    }
}

/// Validates a job's desired state. Returns the first violation found; callers
/// transition the job to `Failed` with `reason`/`message` taken from it.
pub fn validate_spec(spec: &ValidationJobSpec) -> Result<(), ValidationError> {
    validate_git_ref(&spec.notebook.url)?;
    if let Some(golden) = &spec.golden_notebook {
        validate_git_ref(&golden.url)?;
    }

    if spec.golden_notebook.is_none() && spec.comparison.is_some() {
        return Err(err(
            reasons::INVALID_SPEC,
            "comparison is configured but goldenNotebook is absent",
        ));
    }

    if let Some(comparison) = &spec.comparison {
        if let Some(tolerance) = comparison.tolerance
            && (!tolerance.is_finite() || tolerance < 0.0)
        {
            return Err(err(
                reasons::INVALID_SPEC,
                format!("comparison.tolerance must be a positive finite number, got {tolerance}"),
            ));
        }
    }

    let declared: Vec<&str> = spec
        .pod_config
        .env
        .iter()
        .map(|e| e.name.as_str())
        .chain(
            spec.pod_config
                .env_from
                .iter()
                .filter_map(|e| e.prefix.as_deref()),
        )
        .collect();
    for name in declared {
        if RESERVED_ENV_VARS.contains(&name) {
            return Err(err(
                reasons::INVALID_SPEC,
                format!("env var '{name}' is reserved for the execution tool"),
            ));
        }
    }

    Ok(())
}

fn validate_git_ref(url: &str) -> Result<(), ValidationError> {
    let scheme_end = url.find("://").ok_or_else(|| {
        err(
            reasons::INVALID_SPEC,
            "notebook url must be an absolute URL with a scheme",
        )
    })?;
    let scheme = &url[..scheme_end];
    if !["http", "https", "ssh"].contains(&scheme) {
        return Err(err(
            reasons::INVALID_SPEC,
            format!("unsupported git url scheme '{scheme}'"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::EnvVar;
    use validator_types::{ComparisonConfig, ComparisonStrategy, GitRef, PodConfig, ValidationJobSpec};

    fn base_spec() -> ValidationJobSpec {
        ValidationJobSpec {
            notebook: GitRef {
                url: "https://example.com/repo.git".to_string(),
                git_ref: "main".to_string(),
                path: "nb.ipynb".to_string(),
                credentials_secret_ref: None,
            },
            golden_notebook: None,
            pod_config: PodConfig::default(),
            comparison: None,
            timeout_seconds: 1800,
        }
    }

    #[test]
    fn accepts_minimal_valid_spec() {
        assert!(validate_spec(&base_spec()).is_ok());
    }

    #[test]
    fn rejects_relative_notebook_url() {
        let mut spec = base_spec();
        spec.notebook.url = "repo.git".to_string();
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let mut spec = base_spec();
        spec.notebook.url = "ftp://example.com/repo.git".to_string();
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn rejects_comparison_without_golden_notebook() {
        let mut spec = base_spec();
        spec.comparison = Some(ComparisonConfig {
            strategy: ComparisonStrategy::Exact,
            tolerance: None,
            ignore_patterns: vec![],
        });
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn rejects_negative_tolerance() {
        let mut spec = base_spec();
        spec.golden_notebook = Some(spec.notebook.clone());
        spec.comparison = Some(ComparisonConfig {
            strategy: ComparisonStrategy::FuzzyNumeric,
            tolerance: Some(-0.1),
            ignore_patterns: vec![],
        });
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn rejects_reserved_env_var_override() {
        let mut spec = base_spec();
        spec.pod_config.env.push(EnvVar {
            name: "NOTEBOOK_INPUT_PATH".to_string(),
            value: Some("/tmp/x".to_string()),
            value_from: None,
        });
        assert!(validate_spec(&spec).is_err());
    }
}
