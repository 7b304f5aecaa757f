//! Stack specification types.
//!
//! This module defines the structs that map to the `converge.stack.yaml` file.
//! A stack is a declarative program: a list of resources whose properties may
//! reference the outputs of other resources.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

/// The root configuration structure for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution settings (parallelism, retries).
    #[serde(default)]
    #[serde(rename = "execution")]
    pub execution: ExecutionConfig,
    /// Providers keyed by resource-type package (`default` is the fallback).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Resources in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Stack outputs, resolved after apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Post-apply compliance controls.
    #[serde(default)]
    pub compliance: Option<ComplianceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
    /// Process-local state, discarded on exit.
    Memory,
}

/// Execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub concurrency: usize,
    /// Retry policy for transient provider failures.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryPolicy,
}

/// Retry policy for transient provider failures.
///
/// `max_attempts` counts the first call, so `1` disables retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct RetryPolicy {
    /// Total attempts per operation.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// In-process simulated provider.
    Local,
    /// Provider plugin reachable over HTTP.
    Http {
        /// Base URL of the plugin.
        endpoint: String,
        /// Request timeout in seconds.
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
        /// Environment variable holding a bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Logical name, unique within the stack.
    pub name: String,
    /// Resource type (e.g., `aws:dynamodb:Table`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Declared properties; strings may contain `${resource.attribute}` references.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Explicit dependencies in addition to those implied by references.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Compliance configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComplianceConfig {
    /// Controls evaluated after apply.
    #[serde(default)]
    pub controls: Vec<ControlConfig>,
}

/// A single compliance control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    /// Control identifier (e.g., `aws-s3-1`).
    pub id: String,
    /// Short title.
    pub title: String,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Impact between 0.0 and 1.0.
    #[serde(default = "default_impact")]
    pub impact: f64,
    /// Resource type pattern; exact or with a trailing `*`.
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Checks that must all hold for each matching resource.
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

/// A check on one attribute of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConfig {
    /// Dotted attribute path (e.g., `tags.Environment`).
    pub attribute: String,
    /// Attribute must equal this value.
    #[serde(default)]
    pub equals: Option<Value>,
    /// Attribute must not equal this value.
    #[serde(default)]
    pub not_equals: Option<Value>,
    /// Attribute must (or must not) be present.
    #[serde(default)]
    pub exists: Option<bool>,
    /// Attribute must be one of these values.
    #[serde(default)]
    pub one_of: Option<Vec<Value>>,
}

// Default value functions

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    1
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_http_timeout() -> u64 {
    30
}

const fn default_impact() -> f64 {
    1.0
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a policy with the given attempts and a fixed initial delay.
    #[must_use]
    pub fn with_attempts(max_attempts: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            ..Self::default()
        }
    }

    /// Returns the longest single delay allowed.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Returns the delay to wait after the given failed attempt (1-based).
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl StackConfig {
    /// Returns the fully qualified stack name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Looks up a declared resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl ResourceDecl {
    /// Returns the type package (`aws` for `aws:lambda:Function`).
    #[must_use]
    pub fn package(&self) -> &str {
        type_package(&self.resource_type)
    }
}

/// Returns the package segment of a resource type.
#[must_use]
pub fn type_package(resource_type: &str) -> &str {
    resource_type
        .split_once(':')
        .map_or(resource_type, |(package, _)| package)
}
