// Manager error types
// Errors raised by the manager tree and its release cascade

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::{CodedError, EngineError, ErrorCode, ErrorDomain};

/// Manager error codes
pub mod codes {
    use crate::ErrorCode;

    // Manager error codes start with 1000
    pub const CLOSED_MANAGER: ErrorCode = ErrorCode(1001);
    pub const DUPLICATE_KEY: ErrorCode = ErrorCode(1002);
    pub const UNSUPPORTED_OPERATION: ErrorCode = ErrorCode(1003);
    pub const RELEASED: ErrorCode = ErrorCode(1004);
    pub const DATA_TYPE_MISMATCH: ErrorCode = ErrorCode(1005);
    pub const INVALID_ARGUMENT: ErrorCode = ErrorCode(1006);
    pub const RELEASE_FAILED: ErrorCode = ErrorCode(1007);
    pub const RELEASE_PANICKED: ErrorCode = ErrorCode(1008);
}

/// Errors raised by managers, arrays and the release cascade
#[derive(Error, Debug)]
pub enum ManagerError {
    /// A mutating operation was invoked on a manager that is no longer open
    #[error("Manager {manager} is closed")]
    ClosedManager { manager: String },

    /// `attach` found the key already in use and the policy rejects overwrites
    #[error("Resource key '{key}' is already attached to manager {manager}")]
    DuplicateKey { key: String, manager: String },

    /// The engine reported that it cannot run the named operation
    #[error("Engine '{engine}' does not support operation '{operation}'")]
    UnsupportedOperation { engine: String, operation: String },

    /// The array was already released and its native memory is gone
    #[error("Array {0} has been released")]
    Released(String),

    /// Host data does not match the array's data type
    #[error("Data type mismatch: expected {expected}, found {found}")]
    DataTypeMismatch { expected: String, found: String },

    /// A host-side argument check failed before reaching the engine
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine failed to create, read or invoke
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// One or more resources failed to release during a close cascade
    #[error("{0}")]
    Release(ReleaseFailures),

    /// A release panicked; the cascade caught it and carried on
    #[error("Release panicked: {0}")]
    ReleasePanicked(String),
}

impl CodedError for ManagerError {
    fn code(&self) -> ErrorCode {
        use codes::*;
        match self {
            ManagerError::ClosedManager { .. } => CLOSED_MANAGER,
            ManagerError::DuplicateKey { .. } => DUPLICATE_KEY,
            ManagerError::UnsupportedOperation { .. } => UNSUPPORTED_OPERATION,
            ManagerError::Released(_) => RELEASED,
            ManagerError::DataTypeMismatch { .. } => DATA_TYPE_MISMATCH,
            ManagerError::InvalidArgument(_) => INVALID_ARGUMENT,
            ManagerError::Engine(err) => err.code(),
            ManagerError::Release(_) => RELEASE_FAILED,
            ManagerError::ReleasePanicked(_) => RELEASE_PANICKED,
        }
    }

    fn domain(&self) -> ErrorDomain {
        match self {
            ManagerError::Engine(_) => ErrorDomain::Engine,
            _ => ErrorDomain::Manager,
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            ManagerError::Engine(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Convenient Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

// Helper methods for creating manager errors
impl ManagerError {
    /// Create a closed-manager error for the given manager id
    pub fn closed(manager: impl fmt::Display) -> Self {
        ManagerError::ClosedManager {
            manager: manager.to_string(),
        }
    }

    /// Create a new invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ManagerError::InvalidArgument(message.into())
    }

    /// Wrap the payload of a caught panic
    pub fn release_panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ManagerError::ReleasePanicked(message)
    }

    /// Whether this is the error returned for operations on a closed manager
    pub fn is_closed_manager(&self) -> bool {
        matches!(self, ManagerError::ClosedManager { .. })
    }

    /// The release failures carried by this error, if any
    pub fn release_failures(&self) -> Option<&ReleaseFailures> {
        match self {
            ManagerError::Release(failures) => Some(failures),
            _ => None,
        }
    }
}

/// A single resource that failed to release during a cascade
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseFailure {
    /// Key the resource was attached under
    pub key: String,
    /// Code of the underlying error
    pub code: ErrorCode,
    /// Rendered underlying error
    pub message: String,
}

impl fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.key, self.code, self.message)
    }
}

/// Failures collected over a whole close cascade
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseFailures {
    failures: Vec<ReleaseFailure>,
}

impl ReleaseFailures {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the failure of the resource attached under `key`.
    ///
    /// Nested cascade failures are flattened so the caller of the outermost
    /// close sees every failing leaf resource.
    pub fn record(&mut self, key: impl Into<String>, error: ManagerError) {
        match error {
            ManagerError::Release(nested) => self.failures.extend(nested.failures),
            other => self.failures.push(ReleaseFailure {
                key: key.into(),
                code: other.code(),
                message: other.to_string(),
            }),
        }
    }

    /// Append a prepared failure
    pub fn push(&mut self, failure: ReleaseFailure) {
        self.failures.push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReleaseFailure> {
        self.failures.iter()
    }

    /// Keys of every failed resource
    pub fn keys(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.key.as_str()).collect()
    }

    /// `Ok(())` when nothing failed, otherwise `ManagerError::Release`
    pub fn into_result(self) -> ManagerResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Release(self))
        }
    }
}

impl fmt::Display for ReleaseFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed to release", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ReleaseFailures {
    type Item = &'a ReleaseFailure;
    type IntoIter = std::slice::Iter<'a, ReleaseFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.iter()
    }
}
