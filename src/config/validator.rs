//! Stack validation.
//!
//! This module checks a parsed stack for values that would make a run
//! meaningless or unsafe, before any graph is built or state is touched.
//! Structural graph problems (unknown references, cycles) are reported by
//! the graph builder instead.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{
    ComplianceConfig, ProjectConfig, ProviderConfig, ResourceDecl, StackConfig, StateBackend,
    StateConfig, type_package,
};

/// Name of the provider entry used when no package-specific entry exists.
pub const DEFAULT_PROVIDER_KEY: &str = "default";

/// Validator for stack programs.
#[derive(Debug, Default)]
pub struct StackValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl StackValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack, returning the collected warnings on success.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Stack validation passed");
        Ok(result)
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(config, &mut result);
        Self::validate_providers(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        if let Some(compliance) = &config.compliance {
            Self::validate_compliance(compliance, &mut result);
        }

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_project_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Memory => {
                result
                    .warnings
                    .push(String::from("state.backend: memory state is discarded when the run ends"));
            }
            StateBackend::Local => {}
        }
    }

    fn validate_execution(config: &StackConfig, result: &mut ValidationResult) {
        if let Err(errors) = config.execution.validate() {
            for (field, _) in errors.errors() {
                result.error(
                    format!("execution.{field}"),
                    format!("Invalid execution setting '{field}': {errors}"),
                );
            }
        }

        let retry = &config.execution.retry;
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "execution.retry.initial_backoff_ms",
                "Initial backoff cannot exceed max_backoff_ms",
            );
        }
    }

    fn validate_providers(config: &StackConfig, result: &mut ValidationResult) {
        for (key, provider) in &config.providers {
            if let ProviderConfig::Http {
                endpoint,
                timeout_secs,
                ..
            } = provider
            {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    result.error(
                        format!("providers.{key}.endpoint"),
                        format!("Provider endpoint must be an http(s) URL: {endpoint}"),
                    );
                }
                if *timeout_secs == 0 {
                    result.error(
                        format!("providers.{key}.timeout_secs"),
                        "Provider timeout must be at least 1 second",
                    );
                }
            }
        }

        // An empty providers section means everything runs on the local provider.
        if config.providers.is_empty() {
            return;
        }

        for (i, resource) in config.resources.iter().enumerate() {
            let package = type_package(&resource.resource_type);
            if !config.providers.contains_key(package)
                && !config.providers.contains_key(DEFAULT_PROVIDER_KEY)
            {
                result.error(
                    format!("resources[{i}].type"),
                    ConfigError::MissingProvider {
                        resource_type: resource.resource_type.clone(),
                    }
                    .to_string(),
                );
            }
        }
    }

    fn validate_resources(resources: &[ResourceDecl], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in stack"));
            return;
        }

        let mut seen_names = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate resource name: {}", resource.name),
                );
            }

            if !is_valid_resource_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        resource.name
                    ),
                );
            }

            if resource.resource_type.is_empty() {
                result.error(format!("{prefix}.type"), "Resource type cannot be empty");
            } else if !resource.resource_type.contains(':') {
                result.warnings.push(format!(
                    "{prefix}.type: '{}' has no package prefix and will use the default provider",
                    resource.resource_type
                ));
            }

            let mut seen_deps = HashSet::new();
            for dep in &resource.depends_on {
                if !seen_deps.insert(dep.as_str()) {
                    result.warnings.push(format!(
                        "{prefix}.depends_on: '{dep}' is listed more than once"
                    ));
                }
            }
        }
    }

    fn validate_compliance(compliance: &ComplianceConfig, result: &mut ValidationResult) {
        let mut seen_ids = HashSet::new();

        for (i, control) in compliance.controls.iter().enumerate() {
            let prefix = format!("compliance.controls[{i}]");

            if control.id.is_empty() {
                result.error(format!("{prefix}.id"), "Control id cannot be empty");
            } else if !seen_ids.insert(control.id.as_str()) {
                result.error(
                    format!("{prefix}.id"),
                    format!("Duplicate control id: {}", control.id),
                );
            }

            if !(0.0..=1.0).contains(&control.impact) {
                result.error(
                    format!("{prefix}.impact"),
                    format!("Impact must be between 0.0 and 1.0, got {}", control.impact),
                );
            }

            if control.checks.is_empty() {
                result
                    .warnings
                    .push(format!("{prefix}: control '{}' has no checks", control.id));
            }

            for (j, check) in control.checks.iter().enumerate() {
                if check.attribute.is_empty() {
                    result.error(
                        format!("{prefix}.checks[{j}].attribute"),
                        "Check attribute cannot be empty",
                    );
                }
                if check.equals.is_none()
                    && check.not_equals.is_none()
                    && check.exists.is_none()
                    && check.one_of.is_none()
                {
                    result.error(
                        format!("{prefix}.checks[{j}]"),
                        "Check needs one of: equals, not_equals, exists, one_of",
                    );
                }
            }
        }
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if chars.any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource names appear inside `${name.attr}` references, so they cannot
/// contain dots, braces or `$`.
pub(crate) fn is_valid_resource_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackParser;

    fn parse(yaml: &str) -> StackConfig {
        StackParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_project_name() {
        assert!(is_valid_project_name("todo-app"));
        assert!(is_valid_project_name("a1"));
        assert!(!is_valid_project_name(""));
        assert!(!is_valid_project_name("Todo")); // uppercase
        assert!(!is_valid_project_name("1todo")); // starts with number
        assert!(!is_valid_project_name("todo-")); // ends with hyphen
        assert!(!is_valid_project_name("todo--app")); // consecutive hyphens
    }

    #[test]
    fn test_valid_resource_name() {
        assert!(is_valid_resource_name("todoTable"));
        assert!(is_valid_resource_name("get-todos"));
        assert!(is_valid_resource_name("lambda_role"));
        assert!(!is_valid_resource_name("table.name"));
        assert!(!is_valid_resource_name("${x}"));
        assert!(!is_valid_resource_name("-x"));
    }

    #[test]
    fn test_duplicate_resource_names() {
        let config = parse(
            r"
project: { name: app }
resources:
  - { name: table, type: 'aws:dynamodb:Table' }
  - { name: table, type: 'aws:dynamodb:Table' }
",
        );
        let result = StackValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "resources[1].name");
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = parse(
            r"
project: { name: app }
state: { backend: s3 }
resources: []
",
        );
        let err = StackValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("S3 bucket"));
    }

    #[test]
    fn test_unroutable_resource_type() {
        let config = parse(
            r"
project: { name: app }
providers:
  aws: { kind: local }
resources:
  - { name: bucket, type: 'gcp:storage:Bucket' }
",
        );
        let result = StackValidator::new().check(&config);
        assert!(!result.is_valid());
        assert!(result.errors[0].message.contains("gcp:storage:Bucket"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = parse(
            r"
project: { name: app }
execution: { concurrency: 0 }
resources: []
",
        );
        let result = StackValidator::new().check(&config);
        assert_eq!(result.errors[0].field, "execution.concurrency");
    }

    #[test]
    fn test_check_without_predicate() {
        let config = parse(
            r"
project: { name: app }
resources: []
compliance:
  controls:
    - id: c1
      title: nothing
      impact: 1.5
      checks:
        - attribute: tags
",
        );
        let result = StackValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
        assert_eq!(result.warning_count(), 1);
    }
}
