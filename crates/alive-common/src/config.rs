//! Hook installer configuration
//!
//! Loaded from `alive.toml` next to the host executable. Every field has a
//! default so a missing file behaves like an empty one.

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "alive.toml";

/// Settings for one installation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookerConfig {
    /// Newline-delimited hex legacy addresses whose redirection is forced off
    #[serde(default = "default_override_file")]
    pub override_file: PathBuf,
    /// Write the implemented/stubbed progress reports
    #[serde(default)]
    pub save_reports: bool,
    #[serde(default = "default_implemented_report")]
    pub implemented_report: PathBuf,
    #[serde(default = "default_stubbed_report")]
    pub stubbed_report: PathBuf,
    /// Leave stub trap bytes intact so any call into a stub faults
    #[serde(default)]
    pub bytewise_verification: bool,
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_override_file() -> PathBuf {
    PathBuf::from("hook_map.txt")
}

fn default_implemented_report() -> PathBuf {
    PathBuf::from("decompiled_functions.txt")
}

fn default_stubbed_report() -> PathBuf {
    PathBuf::from("stubbed_functions.txt")
}

impl Default for HookerConfig {
    fn default() -> Self {
        Self {
            override_file: default_override_file(),
            save_reports: false,
            implemented_report: default_implemented_report(),
            stubbed_report: default_stubbed_report(),
            bytewise_verification: false,
            logging: LogConfig::default(),
        }
    }
}

/// File layout of `alive.toml`
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    hooks: Option<HookerConfig>,
    #[serde(default)]
    logging: Option<LogConfig>,
}

impl HookerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    ///
    /// Accepts `[hooks]` and `[logging]` tables; a top-level `[logging]`
    /// overrides one nested under `[hooks]`.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        let mut config = file.hooks.unwrap_or_default();
        if let Some(logging) = file.logging {
            config.logging = logging;
        }
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = HookerConfig::default();
        assert_eq!(config.override_file, PathBuf::from("hook_map.txt"));
        assert_eq!(
            config.implemented_report,
            PathBuf::from("decompiled_functions.txt")
        );
        assert_eq!(config.stubbed_report, PathBuf::from("stubbed_functions.txt"));
        assert!(!config.save_reports);
        assert!(!config.bytewise_verification);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = HookerConfig::from_toml(
            r#"
            [hooks]
            save_reports = true
            bytewise_verification = true

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert!(config.save_reports);
        assert!(config.bytewise_verification);
        assert_eq!(config.override_file, PathBuf::from("hook_map.txt"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_toml_empty() {
        let config = HookerConfig::from_toml("").unwrap();
        assert_eq!(config, HookerConfig::default());
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = HookerConfig::from_toml("[hooks]\nsave_reports = \"yes\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = HookerConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, HookerConfig::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hooks]\noverride_file = \"overrides.txt\"").unwrap();
        let config = HookerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.override_file, PathBuf::from("overrides.txt"));
    }
}
