//! Configuration types for SimDrive
//!
//! The store configuration is fixed when a store is opened. It can be built
//! in code, or loaded from a TOML file in which every field is optional.

use crate::types::{BackendType, OperatingMode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Store-wide configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Where chunk contents live
    #[serde(default)]
    pub backend: BackendType,
    /// Backing file (file backend only)
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Maximum size of the backing file in MiB
    #[serde(default = "default_total_capacity_mb")]
    pub total_capacity_mb: u64,
    /// Fill unwritten regions with the zero pattern instead of plain zeros
    #[serde(default = "default_fake_zero_read")]
    pub fake_zero_read: bool,
    /// Lifetime of the backing file
    #[serde(default)]
    pub mode: OperatingMode,
}

fn default_path() -> PathBuf {
    PathBuf::from("./simdrive.dat")
}

const fn default_total_capacity_mb() -> u64 {
    1024
}

const fn default_fake_zero_read() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            path: default_path(),
            total_capacity_mb: default_total_capacity_mb(),
            fake_zero_read: default_fake_zero_read(),
            mode: OperatingMode::default(),
        }
    }
}

impl StoreConfig {
    /// Memory-backed configuration
    #[must_use]
    pub fn memory() -> Self {
        Self::default()
    }

    /// File-backed configuration at the given path
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendType::File,
            path: path.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults when it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.total_capacity_mb == 0 {
            return Err(Error::Configuration(
                "total_capacity_mb must be greater than zero".into(),
            ));
        }
        if self.backend == BackendType::File && self.path.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "file backend requires a path".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.backend, BackendType::Memory);
        assert!(config.fake_zero_read);
        assert_eq!(config.mode, OperatingMode::Permanent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = StoreConfig::from_toml(
            r#"
            backend = "file"
            path = "/tmp/drives.dat"
            mode = "temporary"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendType::File);
        assert_eq!(config.path, PathBuf::from("/tmp/drives.dat"));
        assert_eq!(config.mode, OperatingMode::Temporary);
        assert_eq!(config.total_capacity_mb, 1024);
        assert!(config.fake_zero_read);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            StoreConfig::from_toml("backend = \"tape\""),
            Err(Error::Configuration(_))
        ));
        assert!(StoreConfig::from_toml("total_capacity_mb = 0").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "fake_zero_read = false").unwrap();
        let config = StoreConfig::load(file.path()).unwrap();
        assert!(!config.fake_zero_read);

        let missing = StoreConfig::load("/nonexistent/simdrive.toml").unwrap();
        assert_eq!(missing, StoreConfig::default());
    }
}
