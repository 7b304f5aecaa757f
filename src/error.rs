//! Error types for the converge engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, planning, provider calls and state
//! management.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph construction errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors surfaced outside of a single node.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing or malformed.
    #[error("Invalid environment variable {name}: {message}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// What was wrong with it.
        message: String,
    },

    /// No provider is configured for a resource type.
    #[error("No provider configured for resource type '{resource_type}'")]
    MissingProvider {
        /// The resource type that could not be routed.
        resource_type: String,
    },
}

/// Errors raised while building and linking the resource graph.
///
/// All of these are fatal: they are reported before any provider call and
/// before the state lock is taken.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Resource names along the cycle, first name repeated at the end.
        path: Vec<String>,
    },

    /// A property references a resource that is not declared.
    #[error("Resource '{resource}' property '{property}' references unknown resource in '{reference}'")]
    UnresolvedReference {
        /// The referencing resource.
        resource: String,
        /// The property holding the reference.
        property: String,
        /// The reference text.
        reference: String,
    },

    /// A reference expression is malformed.
    #[error("Invalid reference '{expression}' in resource '{resource}': {reason}")]
    InvalidReference {
        /// The resource holding the expression.
        resource: String,
        /// The offending expression.
        expression: String,
        /// Why it could not be parsed.
        reason: String,
    },

    /// Two resources share the same logical name.
    #[error("Duplicate resource name: {name}")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed for a reason other than contention.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Another run holds the state lock.
    #[error("Another run is active (run: {run_id}, holder: {holder}, since: {since})")]
    ConcurrentRun {
        /// Identifier of the active run.
        run_id: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The run lock was lost mid-run; no further writes are made.
    #[error("Run lock {lock_id} was lost; refusing to write state")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors returned by a provider for a single operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider refused the request.
    #[error("provider rejected request ({status}): {message}")]
    Rejected {
        /// Status code reported by the provider.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The provider is temporarily unavailable.
    #[error("provider unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// Network error.
    #[error("network error talking to provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("invalid provider response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The physical resource does not exist.
    #[error("resource not found: {physical_id}")]
    NotFound {
        /// Physical identifier that was looked up.
        physical_id: String,
    },

    /// The provider call did not complete.
    #[error("provider call aborted: {message}")]
    Aborted {
        /// What happened to the call.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The recorded state contains a dependency cycle.
    #[error("Recorded state has a dependency cycle between: {}", resources.join(", "))]
    StateCycle {
        /// Resources that could not be ordered.
        resources: Vec<String>,
    },

    /// Conflicting operations in plan.
    #[error("Conflicting operations in plan: {message}")]
    ConflictingOperations {
        /// Description of the conflict.
        message: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an unavailability error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if a retry may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Network { .. }
        )
    }

    /// Returns the delay the provider asked for before retrying, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_retryable_provider_errors() {
        assert!(ProviderError::network("reset").is_retryable());
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(!ProviderError::rejected(400, "bad").is_retryable());
        assert!(ConvergeError::Provider(ProviderError::unavailable("503")).is_retryable());
        assert!(!ConvergeError::internal("boom").is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = ProviderError::RateLimited { retry_after_secs: 7 };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ProviderError::network("x").retry_after(), None);
    }
}
