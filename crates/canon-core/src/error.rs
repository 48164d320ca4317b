//! Error taxonomy shared by every component and storage backend.
//!
//! Validation, authorization, not-found, and conflict errors are returned to
//! the caller as-is. External-dependency errors raised during classification
//! are absorbed by the rule-based fallback; everywhere else they propagate.
//! Persistence errors always mean the whole unit of work was rolled back.

use thiserror::Error;

/// Result alias used across `canon-core`.
pub type Result<T> = std::result::Result<T, DedupError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupError {
    /// Bad parameters supplied by the caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// A canonical record, contradiction, review, chunk, or job is missing.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate canonical, already-resolved contradiction, membership race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller lacks the dedup entitlement.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Vector store or text classifier unavailable or timed out.
    #[error("{service} unavailable: {message}")]
    ExternalDependency {
        service: &'static str,
        message: String,
    },

    /// A transaction failed to apply or commit.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl DedupError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        Self::ExternalDependency {
            service,
            message: message.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalDependency { .. } | Self::Persistence(_))
    }

    /// Short machine-friendly label, used in logs and batch error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Authorization(_) => "authorization",
            Self::ExternalDependency { .. } => "external_dependency",
            Self::Persistence(_) => "persistence",
        }
    }
}
