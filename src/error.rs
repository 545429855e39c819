//! Error types for the infragraph engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, provider calls, state management,
//! and reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the engine.
#[derive(Debug, Error)]
pub enum InfraError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

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

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A `${...}` reference could not be interpreted.
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference {
        /// The raw reference text.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The declared graph contains a cycle.
    #[error("Cyclic dependency detected: {cycle}")]
    CyclicDependency {
        /// The cycle, rendered as `a -> b -> a`.
        cycle: String,
    },

    /// A resource references a logical name that was never declared.
    #[error("Resource '{resource}' depends on undeclared resource '{dependency}'")]
    UnknownDependency {
        /// The consuming resource.
        resource: String,
        /// The missing producer.
        dependency: String,
    },

    /// Two resources share a logical name.
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

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
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

    /// The snapshot belongs to another project or environment.
    #[error("State belongs to {found}, not {expected}")]
    ProjectMismatch {
        /// The `project/environment` of the current run.
        expected: String,
        /// The `project/environment` recorded in the snapshot.
        found: String,
    },
}

/// Provider errors.
///
/// Variants are split into transient errors, which the invoker retries with
/// backoff, and fatal errors, which fail the node immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limited by the provider endpoint.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The call did not complete in time.
    #[error("Provider call '{operation}' timed out")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The provider is temporarily unavailable (5xx).
    #[error("Provider unavailable: {status} - {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected the request.
    #[error("Provider rejected request: {status} - {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Resource not found.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider identity of the missing resource.
        id: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// No provider is registered for the type token's package.
    #[error("No provider registered for '{type_token}'")]
    NoProvider {
        /// The unroutable type token.
        type_token: String,
    },

    /// The provider does not implement the requested function.
    #[error("Unknown provider function: {token}")]
    UnknownFunction {
        /// The function token.
        token: String,
    },

    /// The call was aborted by a cancellation signal.
    #[error("Provider call cancelled")]
    Cancelled,
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A node was skipped because one of its dependencies failed.
    #[error("Skipped '{resource}': dependency '{dependency}' failed")]
    DependencyFailed {
        /// The skipped resource.
        resource: String,
        /// The failed dependency.
        dependency: String,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}: {last_error}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resource that failed.
        resource: String,
        /// The final transient error.
        last_error: ProviderError,
    },

    /// A value a node needed could not be resolved.
    #[error("Failed to resolve inputs of '{resource}': {reason}")]
    InputResolution {
        /// The resource whose inputs failed.
        resource: String,
        /// Reason for failure.
        reason: String,
    },

    /// A protected resource would have been deleted.
    #[error("Resource '{resource}' is protected and cannot be {action}")]
    Protected {
        /// The protected resource.
        resource: String,
        /// The refused action.
        action: String,
    },

    /// A resource is missing from the snapshot when a step expected it.
    #[error("Resource '{resource}' has no recorded state")]
    MissingState {
        /// The resource name.
        resource: String,
    },

    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, InfraError>;

impl InfraError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(err) => err.retry_after_secs(),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
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
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Classifies an HTTP status code and body into a provider error.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::AuthenticationFailed { message },
            404 => Self::NotFound { id: message },
            408 => Self::Timeout { operation: message },
            500..=599 => Self::Unavailable { status, message },
            _ => Self::Rejected { status, message },
        }
    }

    /// Returns true for errors worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::Network { .. }
                | Self::Unavailable { .. }
        )
    }

    /// Returns the delay requested by the provider, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(ProviderError::from_status(503, "busy").is_transient());
        assert!(!ProviderError::from_status(400, "bad").is_transient());
        assert!(!ProviderError::from_status(403, "no").is_transient());
        assert!(!ProviderError::Cancelled.is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ProviderError::from_status(404, "x"),
            ProviderError::NotFound { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(401, "x"),
            ProviderError::AuthenticationFailed { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(422, "x"),
            ProviderError::Rejected { status: 422, .. }
        ));
    }

    #[test]
    fn test_retry_delay() {
        let err = InfraError::from(ProviderError::RateLimited { retry_after_secs: 7 });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(7));

        let err = InfraError::from(GraphError::DuplicateResource {
            name: String::from("rg"),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }
}
