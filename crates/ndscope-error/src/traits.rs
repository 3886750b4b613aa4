// Error traits shared by every error type in the workspace

use std::error::Error as StdError;

use crate::{ErrorCode, ErrorDomain};

/// Base trait for all errors raised by ndscope.
pub trait CodedError: StdError + Send + Sync + 'static {
    /// Returns the numeric code for this error.
    fn code(&self) -> ErrorCode;

    /// Returns the component that raised this error.
    fn domain(&self) -> ErrorDomain;

    /// Indicates if the error is temporary and retrying might succeed.
    ///
    /// Nothing in the lifetime core retries; engines that can fail
    /// transiently report it here so callers can decide.
    fn is_transient(&self) -> bool {
        false
    }
}
