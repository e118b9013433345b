//! Error types for the simulation engine

use crate::types::{InstanceId, InstanceState, JobId, JobState};
use thiserror::Error;

/// Simulation engine result type
pub type Result<T> = std::result::Result<T, SimError>;

/// Errors returned synchronously by engine operations.
///
/// Simulated runtime failures (provisioning failure, job failure) are not
/// errors: they are recorded as terminal entity state and observed by polling.
#[derive(Error, Debug)]
pub enum SimError {
    /// Malformed request (bad region, count, job spec)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown GPU SKU
    #[error("Invalid SKU: {0}")]
    InvalidSku(String),

    /// Pool or per-instance capacity cannot satisfy the request
    #[error("Capacity exceeded for {resource}: requested {requested}, available {available}")]
    CapacityExceeded {
        resource: String,
        requested: u32,
        available: u32,
    },

    /// Tenant quota would be exceeded
    #[error("Quota exceeded for tenant {tenant}: {reason}")]
    QuotaExceeded { tenant: String, reason: String },

    /// Instance does not exist or belongs to another tenant
    #[error("Instance {0} not found")]
    InstanceNotFound(InstanceId),

    /// Operation requires a running instance
    #[error("Instance {id} is not running (state: {state})")]
    InstanceNotRunning { id: InstanceId, state: InstanceState },

    /// Job does not exist or belongs to another tenant
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// Job has left the queue
    #[error("Job {id} cannot be cancelled (state: {state})")]
    NotCancellable { id: JobId, state: JobState },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a quota error
    pub fn quota(tenant: impl ToString, reason: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            tenant: tenant.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may succeed by retrying later (capacity frees up
    /// as other instances terminate or jobs finish).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::QuotaExceeded { .. })
    }
}
