// ndscope Error Handling Framework
// Central location for error types, traits, and handling utilities

use std::fmt;

// Re-export common error handling tools for convenience
pub use thiserror;

// Module structure
mod traits;

// Include sub-modules
mod config;
mod engine;
mod manager;

// Public exports
pub use config::{ConfigError, ConfigResult};
pub use engine::{EngineError, EngineResult};
pub use manager::{ManagerError, ManagerResult, ReleaseFailure, ReleaseFailures};
pub use traits::CodedError;

// Numeric codes, per domain
pub use engine::codes as engine_codes;
pub use manager::codes as manager_codes;

/// Error domains representing different components of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorDomain {
    Manager,
    Engine,
    Config,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Manager => write!(f, "manager"),
            ErrorDomain::Engine => write!(f, "engine"),
            ErrorDomain::Config => write!(f, "config"),
        }
    }
}

/// Error code structure for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ErrorCode(pub u32);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display_is_zero_padded() {
        assert_eq!(ErrorCode(7).to_string(), "0007");
        assert_eq!(ErrorCode(1001).to_string(), "1001");
    }

    #[test]
    fn test_domain_display() {
        assert_eq!(ErrorDomain::Manager.to_string(), "manager");
        assert_eq!(ErrorDomain::Engine.to_string(), "engine");
        assert_eq!(ErrorDomain::Config.to_string(), "config");
    }
}
