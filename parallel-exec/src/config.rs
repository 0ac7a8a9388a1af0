//! Configuration loading.
//!
//! Values are read from a TOML file and merged over built-in defaults; no
//! value is required to be present. Lookup order for the file itself
//! mirrors the status-store root resolution in [`crate::store`]: an
//! explicit path wins, then an environment variable, then an XDG-style
//! default location.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ExecResult;

const DEFAULT_MEMORY_LIMIT: &str = "512M";
const DEFAULT_SPAWN_LIMIT_PER_SECOND: u32 = 50;
const DEFAULT_MAX_NESTING_LEVEL: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            enabled: false,
            directory: Some(default_logging_directory()),
        }
    }
}

fn default_logging_directory() -> String {
    std::env::temp_dir().join("parallel_logs").display().to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackgroundProcessConfig {
    pub memory_limit: String,
    pub spawn_limit_per_second: u32,
}

impl Default for BackgroundProcessConfig {
    fn default() -> Self {
        BackgroundProcessConfig {
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            spawn_limit_per_second: DEFAULT_SPAWN_LIMIT_PER_SECOND,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BootstrapConfig {
    pub file: Option<String>,
    pub init_code: Option<String>,
}

/// Root configuration object, typically loaded once at process startup and
/// shared (by reference or clone) with the process manager and the worker
/// binary's own startup path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub logging: LoggingConfig,
    pub background_process: BackgroundProcessConfig,
    pub max_nesting_level: u32,
    pub bootstrap: BootstrapConfig,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        ParallelConfig {
            logging: LoggingConfig::default(),
            background_process: BackgroundProcessConfig::default(),
            max_nesting_level: DEFAULT_MAX_NESTING_LEVEL,
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl ParallelConfig {
    /// Load configuration from an explicit TOML file path.
    pub fn from_file(path: impl AsRef<Path>) -> ExecResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> ExecResult<Self> {
        let cfg: ParallelConfig = toml::from_str(raw).map_err(|e| {
            crate::error::ExecError::Other(anyhow::anyhow!("invalid configuration: {e}"))
        })?;
        Ok(cfg)
    }

    /// Resolve the configuration file following the same priority chain used
    /// for the status-store root: explicit path, then `PARALLEL_EXEC_CONFIG`,
    /// then the platform config directory, falling back to defaults if
    /// nothing is found.
    pub fn load(explicit_path: Option<&str>) -> ExecResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("PARALLEL_EXEC_CONFIG") {
            if !path.is_empty() {
                return Self::from_file(path);
            }
        }

        if let Some(default_path) = default_config_path() {
            if default_path.exists() {
                return Self::from_file(&default_path);
            }
        }

        Ok(ParallelConfig::default())
    }
}

fn default_config_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "parallel-exec")?;
    Some(dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_populated() {
        let cfg = ParallelConfig::default();
        assert_eq!(cfg.max_nesting_level, DEFAULT_MAX_NESTING_LEVEL);
        assert_eq!(cfg.background_process.memory_limit, DEFAULT_MEMORY_LIMIT);
        assert!(!cfg.logging.enabled);
    }

    #[test]
    fn logging_directory_defaults_under_system_temp() {
        let cfg = ParallelConfig::default();
        let dir = cfg.logging.directory.expect("default directory set");
        assert!(dir.ends_with("parallel_logs"), "{dir}");
        assert!(
            PathBuf::from(&dir).starts_with(std::env::temp_dir()),
            "{dir}"
        );
    }

    #[test]
    fn partial_toml_merges_over_defaults() {
        let cfg = ParallelConfig::from_toml_str(
            r#"
            max_nesting_level = 5

            [logging]
            enabled = true
            directory = "/var/log/parallel-exec"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_nesting_level, 5);
        assert!(cfg.logging.enabled);
        assert_eq!(
            cfg.logging.directory.as_deref(),
            Some("/var/log/parallel-exec")
        );
        assert_eq!(
            cfg.background_process.spawn_limit_per_second,
            DEFAULT_SPAWN_LIMIT_PER_SECOND
        );
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg = ParallelConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.max_nesting_level, DEFAULT_MAX_NESTING_LEVEL);
    }
}
