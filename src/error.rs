//! Error types for deskpool.
//!
//! Each component owns an error enum. Lower-level errors are translated at
//! component boundaries so that callers above the orchestrator only ever see
//! [`ControlError`], whose [`ErrorKind`] is the stable outward taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors from the backing atomic store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Stored value could not be decoded: {0}")]
    Serialization(String),
}

/// Errors from the cluster-resource collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("Concurrent modification of {kind} {name}")]
    Conflict { kind: String, name: String },

    #[error("Cluster API returned HTTP {status}: {reason}")]
    Api { status: u16, reason: String },

    #[error("Cluster API request failed: {0}")]
    Transport(String),

    #[error("Invalid cluster API response: {0}")]
    InvalidResponse(String),
}

impl ClusterError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from the identity store and token gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Malformed token")]
    Malformed,

    #[error("Token not recognised")]
    NotFound,

    #[error("Token has been revoked")]
    Revoked,

    #[error("Identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the port allocator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("No free port in {namespace} pool {start}-{end}")]
    PoolExhausted {
        namespace: String,
        start: u16,
        end: u16,
    },

    #[error("Port namespace {0} is not configured")]
    NamespaceDisabled(String),

    #[error("Mapping table unavailable: {0}")]
    Backend(String),
}

impl From<ClusterError> for PortError {
    fn from(e: ClusterError) -> Self {
        PortError::Backend(e.to_string())
    }
}

impl From<StoreError> for PortError {
    fn from(e: StoreError) -> Self {
        PortError::Backend(e.to_string())
    }
}

/// Errors from the distributed lock.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("Timed out acquiring lock {key} after {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from environment orchestration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Timed out acquiring lock {key}")]
    LockTimeout { key: String },

    #[error("Lock {key} was lost before {step} for user {user_id}")]
    LockLost {
        user_id: String,
        key: String,
        step: String,
    },

    #[error("No environment for user {user_id}")]
    NotFound { user_id: String },

    #[error("Provisioning for user {user_id} failed at {step}: {reason}")]
    PartialProvisioningFailure {
        user_id: String,
        step: String,
        reason: String,
    },

    #[error("Teardown for user {user_id} failed at {step}: {reason}")]
    PartialTeardownFailure {
        user_id: String,
        step: String,
        reason: String,
    },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Backing service unavailable: {0}")]
    BackingServiceUnavailable(String),
}

impl From<LockError> for OrchestratorError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { key, .. } => OrchestratorError::LockTimeout { key },
            LockError::Store(e) => OrchestratorError::BackingServiceUnavailable(e.to_string()),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::BackingServiceUnavailable(e.to_string())
    }
}

/// The outward error taxonomy seen by the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LockTimeout,
    AlreadyExists,
    NotFound,
    Unauthorized,
    Revoked,
    Forbidden,
    RateLimited,
    PoolExhausted,
    PartialProvisioningFailure,
    BackingServiceUnavailable,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockTimeout => "lock_timeout",
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Revoked => "revoked",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::PoolExhausted => "pool_exhausted",
            Self::PartialProvisioningFailure => "partial_provisioning_failure",
            Self::BackingServiceUnavailable => "backing_service_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Structured error returned to the outer request layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Errors surfaced by the [`ControlPlane`](crate::control::ControlPlane) facade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(AuthError::Revoked) => ErrorKind::Revoked,
            Self::Auth(AuthError::Malformed | AuthError::NotFound) => ErrorKind::Unauthorized,
            Self::Auth(AuthError::Unavailable(_)) => ErrorKind::BackingServiceUnavailable,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Orchestrator(e) => match e {
                OrchestratorError::LockTimeout { .. } | OrchestratorError::LockLost { .. } => {
                    ErrorKind::LockTimeout
                }
                OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
                OrchestratorError::PartialProvisioningFailure { .. }
                | OrchestratorError::PartialTeardownFailure { .. } => {
                    ErrorKind::PartialProvisioningFailure
                }
                OrchestratorError::Port(PortError::PoolExhausted { .. }) => {
                    ErrorKind::PoolExhausted
                }
                OrchestratorError::Port(_) | OrchestratorError::BackingServiceUnavailable(_) => {
                    ErrorKind::BackingServiceUnavailable
                }
            },
        }
    }

    /// Render for the request layer.
    ///
    /// Infrastructure faults get a generic message; their detail only goes
    /// to the log.
    pub fn to_api_error(&self) -> ApiError {
        let kind = self.kind();
        let message = match kind {
            ErrorKind::BackingServiceUnavailable => {
                tracing::error!(error = %self, "Infrastructure fault surfaced to caller");
                "A backing service is temporarily unavailable".to_string()
            }
            ErrorKind::PartialProvisioningFailure => {
                "Environment is partially provisioned; retry the request or delete it".to_string()
            }
            _ => self.to_string(),
        };
        ApiError {
            code: kind.code().to_string(),
            message,
        }
    }
}
