//! Manager configuration
//!
//! Settings shared by every manager of a registry: default placement and
//! data type for allocations, and how `attach` treats key collisions.

use std::path::Path;

use ndscope_error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

use crate::types::{DataType, Device};

/// What `attach` does when the key is already present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeyPolicy {
    /// Replace the previous entry, log a warning and return it to the caller.
    /// The previous resource is not released.
    #[default]
    Warn,
    /// Refuse the attach with `ManagerError::DuplicateKey`
    Reject,
}

/// Configuration for a manager tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Device used by base managers created without an explicit device
    pub default_device: Device,

    /// Data type used by allocation helpers that do not take one
    pub default_data_type: DataType,

    /// Key collision handling for `attach`
    pub duplicate_keys: DuplicateKeyPolicy,

    /// Emit a debug event per resource released during a cascade
    pub log_releases: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_device: Device::Cpu,
            default_data_type: DataType::Float32,
            duplicate_keys: DuplicateKeyPolicy::Warn,
            log_releases: false,
        }
    }
}

impl ManagerConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_default_device(mut self, device: Device) -> Self {
        self.default_device = device;
        self
    }

    pub fn with_default_data_type(mut self, data_type: DataType) -> Self {
        self.default_data_type = data_type;
        self
    }

    pub fn with_duplicate_keys(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.duplicate_keys = policy;
        self
    }

    pub fn with_log_releases(mut self, enabled: bool) -> Self {
        self.log_releases = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.default_device, Device::Cpu);
        assert_eq!(config.default_data_type, DataType::Float32);
        assert_eq!(config.duplicate_keys, DuplicateKeyPolicy::Warn);
        assert!(!config.log_releases);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = ManagerConfig::from_toml_str(
            r#"
            default_device = { gpu = 1 }
            duplicate_keys = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.default_device, Device::Gpu(1));
        assert_eq!(config.duplicate_keys, DuplicateKeyPolicy::Reject);
        assert_eq!(config.default_data_type, DataType::Float32);
    }

    #[test]
    fn test_parse_error() {
        let err = ManagerConfig::from_toml_str("duplicate_keys = \"explode\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_data_type = \"float64\"").unwrap();
        writeln!(file, "log_releases = true").unwrap();

        let config = ManagerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.default_data_type, DataType::Float64);
        assert!(config.log_releases);

        let missing = ManagerConfig::from_file("/nonexistent/ndscope.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
