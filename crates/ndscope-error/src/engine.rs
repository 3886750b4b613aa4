// Engine-specific error types
// These errors are reported by native engine implementations

use thiserror::Error;

use crate::{CodedError, ErrorCode, ErrorDomain};

/// Engine error codes
pub mod codes {
    use crate::ErrorCode;

    // Engine error codes start with 2000
    pub const ALLOCATION_FAILED: ErrorCode = ErrorCode(2001);
    pub const INVALID_HANDLE: ErrorCode = ErrorCode(2002);
    pub const RELEASE_FAILED: ErrorCode = ErrorCode(2003);
    pub const UNSUPPORTED: ErrorCode = ErrorCode(2004);
    pub const INVALID_ARGUMENT: ErrorCode = ErrorCode(2005);
    pub const OPERATION_FAILED: ErrorCode = ErrorCode(2006);
}

/// Errors reported by a native engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not allocate native memory
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// The handle is unknown to the engine (never allocated or already freed)
    #[error("Invalid native handle: {0}")]
    InvalidHandle(u64),

    /// The native release primitive reported an error
    #[error("Release of native handle {handle} failed: {message}")]
    ReleaseFailed { handle: u64, message: String },

    /// The engine has no implementation for the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The engine rejected an argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other engine failure
    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl CodedError for EngineError {
    fn code(&self) -> ErrorCode {
        use codes::*;
        match self {
            EngineError::AllocationFailed(_) => ALLOCATION_FAILED,
            EngineError::InvalidHandle(_) => INVALID_HANDLE,
            EngineError::ReleaseFailed { .. } => RELEASE_FAILED,
            EngineError::Unsupported(_) => UNSUPPORTED,
            EngineError::InvalidArgument(_) => INVALID_ARGUMENT,
            EngineError::OperationFailed(_) => OPERATION_FAILED,
        }
    }

    fn domain(&self) -> ErrorDomain {
        ErrorDomain::Engine
    }
}

/// Convenient Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// Helper methods for creating engine errors
impl EngineError {
    /// Create a new allocation error
    pub fn allocation(message: impl Into<String>) -> Self {
        EngineError::AllocationFailed(message.into())
    }

    /// Create a new invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        EngineError::InvalidArgument(message.into())
    }

    /// Create a new release error for a handle
    pub fn release_failed(handle: u64, message: impl Into<String>) -> Self {
        EngineError::ReleaseFailed {
            handle,
            message: message.into(),
        }
    }
}
