//! Runtime configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! is a valid configuration.
//!
//! ```toml
//! log_filter = "tether_core=debug"
//! assert_instance_ids = true
//! track_handles = true
//! frame_pool_size = 8
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable naming a config file to load at library init
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Largest allowed per-thread frame pool
pub const MAX_FRAME_POOL: usize = 1024;

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `env_logger` filter string; falls back to `RUST_LOG`
    pub log_filter: Option<String>,

    /// Check that engine-owned receivers are still alive before every invoke
    pub assert_instance_ids: bool,

    /// Warn about handles still outstanding when the runtime shuts down
    pub track_handles: bool,

    /// Frame buffers kept per thread for reuse
    pub frame_pool_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            assert_instance_ids: true,
            track_handles: true,
            frame_pool_size: 8,
        }
    }
}

impl RuntimeConfig {
    /// Parse from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load the file named by `TETHER_CONFIG`, or defaults when unset
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_pool_size > MAX_FRAME_POOL {
            return Err(ConfigError::Invalid(format!(
                "frame_pool_size {} exceeds {}",
                self.frame_pool_size, MAX_FRAME_POOL
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_is_default() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.assert_instance_ids);
    }

    #[test]
    fn test_partial_config() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            log_filter = "tether_core=debug"
            frame_pool_size = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.log_filter.as_deref(), Some("tether_core=debug"));
        assert_eq!(config.frame_pool_size, 2);
        assert!(config.track_handles);
    }

    #[test]
    fn test_rejects_oversized_pool() {
        let err = RuntimeConfig::from_toml_str("frame_pool_size = 5000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_toml() {
        let err = RuntimeConfig::from_toml_str("frame_pool_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "assert_instance_ids = false").unwrap();
        let config = RuntimeConfig::load(file.path()).unwrap();
        assert!(!config.assert_instance_ids);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
