//! Application error types for the sync engine.
//!
//! All expected failure modes are represented as variants here and returned
//! through `Result`; phases wrap messages with context as errors propagate so
//! the final persisted status message is diagnosable without re-running.

use serde::Serialize;
use thiserror::Error;

/// Application-level errors shared by every sync phase.
///
/// All variants serialize to a structured JSON object for callers that
/// persist or display them.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// GitHub API request failed.
    #[error("GitHub API error: {message}")]
    GitHubApi {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// The provider rejected the request due to rate limiting.
    ///
    /// Distinguished from generic API errors so callers can back off and
    /// retry the same page/cursor instead of failing the phase.
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reset_at: Option<i64>,
    },

    /// Network request failed.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The provider reported a commit's recursive tree as truncated.
    ///
    /// Structural and fatal for the repo: continuing would leave the mirror
    /// incomplete, so this is surfaced to the caller and never retried.
    #[error("Truncated tree for commit {commit_sha} in {repo}")]
    TruncatedTree { repo: String, commit_sha: String },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Invalid input provided.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Sync phase failed with context.
    #[error("Sync error: {message}")]
    Sync {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },

    /// The download was cancelled externally.
    ///
    /// A stop signal, not a failure: it propagates up without being treated
    /// as an error and must never overwrite a `cancelled` status.
    #[error("Cancelled")]
    Cancelled,

    /// Internal application error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a database error with operation context.
    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a GitHub API error.
    pub fn github_api(message: impl Into<String>) -> Self {
        Self::GitHubApi {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a GitHub API error with status code and endpoint.
    pub fn github_api_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::GitHubApi {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a rate-limit error.
    pub fn rate_limited(message: impl Into<String>, reset_at: Option<i64>) -> Self {
        Self::RateLimited {
            message: message.into(),
            reset_at,
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a truncated-tree error for a commit.
    pub fn truncated_tree(repo: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::TruncatedTree {
            repo: repo.into(),
            commit_sha: commit_sha.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a sync error.
    pub fn sync(message: impl Into<String>) -> Self {
        Self::Sync {
            message: message.into(),
            phase: None,
        }
    }

    /// Create a sync error tagged with the phase it occurred in.
    pub fn sync_in_phase(message: impl Into<String>, phase: impl Into<String>) -> Self {
        Self::Sync {
            message: message.into(),
            phase: Some(phase.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this is a retryable rate-limit error.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this is a structural truncated-tree failure.
    pub fn is_truncated_tree(&self) -> bool {
        matches!(self, Self::TruncatedTree { .. })
    }
}

// Conversions from common error types

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else if err.is_status() {
            Self::github_api(format!("HTTP error: {}", err))
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(err: crate::db::DbError) -> Self {
        Self::database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = AppError::database("connection failed");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"Database\""));
        assert!(json.contains("connection failed"));
    }

    #[test]
    fn test_github_api_error_full() {
        let err = AppError::github_api_full("Not Found", 404, "/repos/acme/widgets");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"status_code\":404"));
        assert!(json.contains("/repos/acme/widgets"));
    }

    #[test]
    fn test_cancelled_predicate() {
        assert!(AppError::Cancelled.is_cancelled());
        assert!(!AppError::internal("x").is_cancelled());
    }

    #[test]
    fn test_rate_limited_predicate() {
        let err = AppError::rate_limited("slow down", Some(1_700_000_000));
        assert!(err.is_rate_limited());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_truncated_tree_display() {
        let err = AppError::truncated_tree("acme/widgets", "abc123");
        assert_eq!(
            format!("{}", err),
            "Truncated tree for commit abc123 in acme/widgets"
        );
    }

    #[test]
    fn test_optional_fields_not_serialized() {
        let err = AppError::database("error");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("operation"));
    }
}
