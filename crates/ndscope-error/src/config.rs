// Configuration error types

use std::path::PathBuf;

use thiserror::Error;

use crate::{CodedError, ErrorCode, ErrorDomain};

/// Config error codes
pub mod codes {
    use crate::ErrorCode;

    // Config error codes start with 3000
    pub const IO_ERROR: ErrorCode = ErrorCode(3001);
    pub const PARSE_ERROR: ErrorCode = ErrorCode(3002);
}

/// Errors raised while loading a manager configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration text is not valid
    #[error("Failed to parse config: {0}")]
    Parse(String),
}

impl CodedError for ConfigError {
    fn code(&self) -> ErrorCode {
        match self {
            ConfigError::Io { .. } => codes::IO_ERROR,
            ConfigError::Parse(_) => codes::PARSE_ERROR,
        }
    }

    fn domain(&self) -> ErrorDomain {
        ErrorDomain::Config
    }
}

/// Convenient Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;
