//! Error types for the MySQL operator.
//!
//! Everything the operator does funnels into [`Error`], with a matching
//! [`Result`] alias. Reconciliation entry points inspect errors through the
//! classification helpers instead of matching on API error codes directly:
//!
//! - [`Error::is_invalid`] detects a platform rejection of an immutable field,
//!   which the storage expansion path keys off.
//! - [`Error::is_not_found`] lets pollers treat a vanished object as "not yet".
//! - [`Error::is_retryable`] separates transient conditions from real failures.

use thiserror::Error;

/// Main error type for the operator.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("CRD not installed. Please install the MysqlCluster CRDs first.")]
    CrdNotInstalled,

    #[error("MySQL error: {0}")]
    Sql(#[from] mysql_async::Error),

    #[error("Consensus agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Consensus agent at {host} answered {path} with HTTP {status}")]
    ConsensusStatus {
        host: String,
        path: String,
        status: u16,
    },

    #[error("Secret {secret} has no key {key}")]
    MissingSecretKey { secret: String, key: String },

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid cluster spec: {0}")]
    InvalidSpec(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("can't start/continue 'update': pod[{0}] is unhealthy")]
    MemberUnhealthy(String),

    #[error("can't start/continue 'update': waiting for backup of {0} to complete")]
    BackupInProgress(String),

    #[error("pod {0} is in failed phase")]
    PodFailed(String),

    #[error("pod {0} is ready, wait next schedule")]
    PodRevisionMismatch(String),

    #[error("{0}")]
    Replication(String),

    #[error("owner is deleted")]
    OwnerDeleted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for operator operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    /// The platform refused the write because it violates field validation,
    /// typically a change to an immutable part of a workload spec.
    pub fn is_invalid(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(response)) => {
                response.code == 422 || response.reason == "Invalid"
            }
            _ => false,
        }
    }

    /// The addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404) || matches!(self, Error::NotFound(_))
    }

    /// The optimistic-concurrency check on a write failed.
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Check if this error is retryable without operator intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Sql(_)
            | Error::Http(_)
            | Error::ConsensusStatus { .. }
            | Error::Timeout(_)
            | Error::MemberUnhealthy(_)
            | Error::BackupInProgress(_)
            | Error::PodRevisionMismatch(_)
            | Error::Replication(_) => true,
            Error::Kube(_) => self.is_conflict() || self.api_code().map_or(true, |c| c >= 500),
            _ => false,
        }
    }

    /// Short, bounded label used for the error counter.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::CrdNotInstalled => "crd_not_installed",
            Error::Sql(_) => "sql",
            Error::Http(_) | Error::ConsensusStatus { .. } => "consensus",
            Error::MissingSecretKey { .. } => "secret",
            Error::InvalidConfig { .. } | Error::InvalidSpec(_) => "invalid",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::MemberUnhealthy(_) => "member_unhealthy",
            Error::BackupInProgress(_) => "backup_in_progress",
            Error::PodFailed(_) | Error::PodRevisionMismatch(_) => "pod",
            Error::Replication(_) => "replication",
            Error::OwnerDeleted => "owner_deleted",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}
