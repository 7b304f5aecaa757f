//! Post-apply compliance validation.
//!
//! Validators look at the applied resources and report a pass, fail or skip
//! per control. Failures are reported, never rolled back.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{CheckConfig, ComplianceConfig, ControlConfig};
use crate::graph::{Outputs, ResourceId};
use crate::state::{StackState, StateRecord};

/// An applied resource as seen by validators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// Resource identity.
    pub id: ResourceId,
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Applied properties.
    pub properties: BTreeMap<String, Value>,
    /// Reported outputs.
    pub outputs: BTreeMap<String, Value>,
}

/// Status of a control after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    /// Every matching resource satisfied every check.
    Passed,
    /// At least one matching resource failed a check.
    Failed,
    /// No resource matched the control.
    Skipped,
}

/// A failed check on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailure {
    /// Resource that failed.
    pub resource: String,
    /// Attribute that was checked.
    pub attribute: String,
    /// What was wrong.
    pub message: String,
}

/// Result of one control.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResult {
    /// Control identifier.
    pub id: String,
    /// Control title.
    pub title: String,
    /// Impact between 0.0 and 1.0.
    pub impact: f64,
    /// Outcome.
    pub status: ControlStatus,
    /// Number of resources the control applied to.
    pub checked: usize,
    /// Failed checks.
    pub failures: Vec<CheckFailure>,
}

/// Aggregated results of all validators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComplianceReport {
    /// Results per control.
    pub results: Vec<ControlResult>,
    /// Controls that passed.
    pub passed: usize,
    /// Controls that failed.
    pub failed: usize,
    /// Controls that matched nothing.
    pub skipped: usize,
}

/// Something that validates applied resources.
#[async_trait]
pub trait ComplianceValidator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Evaluates the validator's controls.
    async fn validate(&self, resources: &[ResourceSnapshot]) -> Vec<ControlResult>;
}

/// The controls declared in the stack file.
#[derive(Debug, Clone)]
pub struct ControlSet {
    name: String,
    controls: Vec<ControlConfig>,
}

impl ResourceSnapshot {
    /// Builds a snapshot from a state record.
    #[must_use]
    pub fn from_record(record: &StateRecord) -> Self {
        Self {
            id: record.id.clone(),
            physical_id: record.physical_id.clone(),
            properties: record.properties.clone(),
            outputs: record.outputs.clone(),
        }
    }

    /// Snapshots every record in a state document.
    #[must_use]
    pub fn from_state(state: &StackState) -> Vec<Self> {
        state.records.values().map(Self::from_record).collect()
    }

    /// Looks up a dotted attribute in the outputs, then in the properties.
    #[must_use]
    pub fn attribute(&self, path: &str) -> Option<Value> {
        let outputs = Outputs {
            physical_id: self.physical_id.clone(),
            attributes: self.outputs.clone(),
        };
        outputs.get(path).or_else(|| {
            Outputs {
                physical_id: self.physical_id.clone(),
                attributes: self.properties.clone(),
            }
            .get(path)
        })
    }
}

impl ControlSet {
    /// Creates a control set from the stack's compliance section.
    #[must_use]
    pub fn from_config(config: &ComplianceConfig) -> Self {
        Self {
            name: String::from("stack"),
            controls: config.controls.clone(),
        }
    }

    /// Number of controls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// Returns true if there are no controls.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    fn evaluate(control: &ControlConfig, resources: &[ResourceSnapshot]) -> ControlResult {
        let matching: Vec<&ResourceSnapshot> = resources
            .iter()
            .filter(|r| {
                control
                    .resource_type
                    .as_deref()
                    .is_none_or(|pattern| type_matches(pattern, &r.id.resource_type))
            })
            .collect();

        let failures: Vec<CheckFailure> = matching
            .iter()
            .flat_map(|resource| {
                control
                    .checks
                    .iter()
                    .filter_map(move |check| run_check(check, resource))
            })
            .collect();

        let status = if matching.is_empty() {
            ControlStatus::Skipped
        } else if failures.is_empty() {
            ControlStatus::Passed
        } else {
            ControlStatus::Failed
        };

        debug!("Control {} {:?} on {} resources", control.id, status, matching.len());

        ControlResult {
            id: control.id.clone(),
            title: control.title.clone(),
            impact: control.impact,
            status,
            checked: matching.len(),
            failures,
        }
    }
}

#[async_trait]
impl ComplianceValidator for ControlSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, resources: &[ResourceSnapshot]) -> Vec<ControlResult> {
        self.controls
            .iter()
            .map(|control| Self::evaluate(control, resources))
            .collect()
    }
}

/// Matches a resource type against an exact pattern or one ending in `*`.
#[must_use]
pub fn type_matches(pattern: &str, resource_type: &str) -> bool {
    pattern
        .strip_suffix('*')
        .map_or(pattern == resource_type, |prefix| resource_type.starts_with(prefix))
}

fn run_check(check: &CheckConfig, resource: &ResourceSnapshot) -> Option<CheckFailure> {
    let actual = resource.attribute(&check.attribute);
    let fail = |message: String| {
        Some(CheckFailure {
            resource: resource.id.name.clone(),
            attribute: check.attribute.clone(),
            message,
        })
    };

    if let Some(should_exist) = check.exists {
        if should_exist && actual.is_none() {
            return fail(String::from("is missing"));
        }
        if !should_exist && actual.is_some() {
            return fail(String::from("must not be set"));
        }
    }

    if let Some(expected) = &check.equals
        && actual.as_ref() != Some(expected)
    {
        return fail(format!("expected {expected}, found {}", describe(actual.as_ref())));
    }

    if let Some(forbidden) = &check.not_equals
        && actual.as_ref() == Some(forbidden)
    {
        return fail(format!("must not be {forbidden}"));
    }

    if let Some(allowed) = &check.one_of
        && !actual.as_ref().is_some_and(|v| allowed.contains(v))
    {
        return fail(format!(
            "{} is not one of {}",
            describe(actual.as_ref()),
            Value::Array(allowed.clone())
        ));
    }

    None
}

fn describe(value: Option<&Value>) -> String {
    value.map_or_else(|| String::from("nothing"), ToString::to_string)
}

/// Runs every validator and aggregates the results.
pub async fn run_validators(
    validators: &[Arc<dyn ComplianceValidator>],
    resources: &[ResourceSnapshot],
) -> ComplianceReport {
    let mut report = ComplianceReport::default();

    for validator in validators {
        info!("Running compliance validator '{}'", validator.name());
        for result in validator.validate(resources).await {
            match result.status {
                ControlStatus::Passed => report.passed += 1,
                ControlStatus::Failed => {
                    warn!(
                        "Control {} failed on {} resource(s)",
                        result.id,
                        result.failures.len()
                    );
                    report.failed += 1;
                }
                ControlStatus::Skipped => report.skipped += 1,
            }
            report.results.push(result);
        }
    }

    report
}

impl ComplianceReport {
    /// Returns true if any control failed.
    #[must_use]
    pub const fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl std::fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ComplianceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} controls: {} passed, {} failed, {} skipped",
            self.results.len(),
            self.passed,
            self.failed,
            self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(name: &str, resource_type: &str, properties: Value, outputs: Value) -> ResourceSnapshot {
        ResourceSnapshot {
            id: ResourceId::new(name, resource_type),
            physical_id: format!("{name}-1"),
            properties: serde_json::from_value(properties).unwrap(),
            outputs: serde_json::from_value(outputs).unwrap(),
        }
    }

    fn check(attribute: &str) -> CheckConfig {
        CheckConfig {
            attribute: attribute.to_string(),
            equals: None,
            not_equals: None,
            exists: None,
            one_of: None,
        }
    }

    fn control(id: &str, resource_type: Option<&str>, checks: Vec<CheckConfig>) -> ControlConfig {
        ControlConfig {
            id: id.to_string(),
            title: format!("control {id}"),
            description: None,
            impact: 0.7,
            resource_type: resource_type.map(String::from),
            checks,
        }
    }

    fn resources() -> Vec<ResourceSnapshot> {
        vec![
            snapshot(
                "get-todos",
                "aws:lambda:Function",
                json!({"tags": {"Environment": "dev"}, "runtime": "nodejs18.x"}),
                json!({"arn": "arn:aws:lambda:fn"}),
            ),
            snapshot(
                "add-todo",
                "aws:lambda:Function",
                json!({"runtime": "python2.7"}),
                json!({}),
            ),
            snapshot("todo-table", "aws:dynamodb:Table", json!({}), json!({"encrypted": true})),
        ]
    }

    async fn evaluate(controls: Vec<ControlConfig>) -> Vec<ControlResult> {
        ControlSet::from_config(&ComplianceConfig { controls })
            .validate(&resources())
            .await
    }

    #[test]
    fn test_type_patterns() {
        assert!(type_matches("aws:lambda:*", "aws:lambda:Function"));
        assert!(type_matches("aws:dynamodb:Table", "aws:dynamodb:Table"));
        assert!(!type_matches("aws:dynamodb:Table", "aws:dynamodb:TableItem"));
        assert!(type_matches("*", "anything"));
    }

    #[test]
    fn test_attribute_prefers_outputs() {
        let r = snapshot("t", "x", json!({"name": "declared"}), json!({"name": "actual"}));
        assert_eq!(r.attribute("name"), Some(json!("actual")));
        assert_eq!(r.attribute("id"), Some(json!("t-1")));
        assert_eq!(r.attribute("missing"), None);
    }

    #[tokio::test]
    async fn test_equals_reports_failing_resources() {
        let mut tag = check("tags.Environment");
        tag.equals = Some(json!("dev"));
        let results = evaluate(vec![control("tags-1", Some("aws:lambda:*"), vec![tag])]).await;

        assert_eq!(results[0].status, ControlStatus::Failed);
        assert_eq!(results[0].checked, 2);
        assert_eq!(results[0].failures.len(), 1);
        assert_eq!(results[0].failures[0].resource, "add-todo");
        assert_eq!(results[0].failures[0].message, "expected \"dev\", found nothing");
    }

    #[tokio::test]
    async fn test_one_of_and_not_equals() {
        let mut runtime = check("runtime");
        runtime.one_of = Some(vec![json!("nodejs18.x"), json!("python3.12")]);
        let mut not_legacy = check("runtime");
        not_legacy.not_equals = Some(json!("python2.7"));

        let results = evaluate(vec![
            control("runtime-1", Some("aws:lambda:Function"), vec![runtime]),
            control("runtime-2", Some("aws:lambda:Function"), vec![not_legacy]),
        ])
        .await;

        assert!(results.iter().all(|r| r.status == ControlStatus::Failed));
        assert!(results.iter().all(|r| r.failures[0].resource == "add-todo"));
    }

    #[tokio::test]
    async fn test_exists_passes_and_unmatched_is_skipped() {
        let mut encrypted = check("encrypted");
        encrypted.exists = Some(true);
        let results = evaluate(vec![
            control("ddb-1", Some("aws:dynamodb:Table"), vec![encrypted]),
            control("s3-1", Some("aws:s3:Bucket"), vec![check("acl")]),
        ])
        .await;

        assert_eq!(results[0].status, ControlStatus::Passed);
        assert_eq!(results[1].status, ControlStatus::Skipped);
    }

    #[tokio::test]
    async fn test_report_counts() {
        let mut tag = check("tags.Environment");
        tag.exists = Some(true);
        let set: Arc<dyn ComplianceValidator> = Arc::new(ControlSet::from_config(&ComplianceConfig {
            controls: vec![
                control("tags-1", Some("aws:lambda:*"), vec![tag]),
                control("none", Some("gcp:*"), vec![]),
            ],
        }));

        let report = run_validators(&[set], &resources()).await;
        assert_eq!((report.passed, report.failed, report.skipped), (0, 1, 1));
        assert!(report.has_failures());
        assert_eq!(report.to_string(), "2 controls: 0 passed, 1 failed, 1 skipped");
    }
}
