//! Module for application configuration settings.
//!
//! User configurations may be specified in a TOML configuration file. Every setting has a
//! default, so a missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use zx_cfs::{CfsOptions, Tuning};

fn default_backing() -> PathBuf {
    dirs::home_dir()
        .map_or_else(|| PathBuf::from("/tmp/zx-cfs"), |h| h.join("zx"))
}

fn default_user() -> String {
    zx_cfs::auth::current_user()
}

/// Timing and concurrency knobs, times in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TuningConfig {
    pub cache_tout: u64,
    pub poll_ival: u64,
    pub ival_tout: u64,
    pub sync_delay: u64,
    pub max_sync_delay: u64,
    pub nsyncers: usize,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for TuningConfig {
    fn default() -> Self {
        let t = Tuning::default();
        Self {
            cache_tout: millis(t.cache_tout),
            poll_ival: millis(t.poll_ival),
            ival_tout: millis(t.ival_tout),
            sync_delay: millis(t.sync_delay),
            max_sync_delay: millis(t.max_sync_delay),
            nsyncers: t.nsyncers,
        }
    }
}

impl From<&TuningConfig> for Tuning {
    fn from(t: &TuningConfig) -> Self {
        Self {
            cache_tout: Duration::from_millis(t.cache_tout),
            poll_ival: Duration::from_millis(t.poll_ival),
            ival_tout: Duration::from_millis(t.ival_tout),
            sync_delay: Duration::from_millis(t.sync_delay),
            max_sync_delay: Duration::from_millis(t.max_sync_delay),
            nsyncers: t.nsyncers,
        }
    }
}

/// The trees served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TreesConfig {
    /// Host directory backing the cache.
    #[serde(default = "default_backing")]
    pub backing: PathBuf,

    /// Name shown in logs and `/Ctl`. Derived from the backing tree when empty.
    #[serde(default)]
    pub name: String,
}

impl Default for TreesConfig {
    fn default() -> Self {
        Self {
            backing: default_backing(),
            name: String::new(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub tuning: TuningConfig,

    #[serde(default)]
    pub trees: TreesConfig,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub no_perm_check: bool,

    #[serde(default)]
    pub trace_locks: bool,

    #[serde(default)]
    pub debug: bool,

    /// Owner of `/Ctl` and `/Chg`. If not specified, the current user.
    #[serde(default = "default_user")]
    pub user: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tuning: TuningConfig::default(),
            trees: TreesConfig::default(),
            read_only: false,
            no_perm_check: false,
            trace_locks: false,
            debug: false,
            user: default_user(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` with every problem found otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let t = &self.tuning;

        for (name, ms) in [
            ("cache-tout", t.cache_tout),
            ("poll-ival", t.poll_ival),
            ("ival-tout", t.ival_tout),
            ("sync-delay", t.sync_delay),
            ("max-sync-delay", t.max_sync_delay),
        ] {
            if ms == 0 {
                errors.push(format!("tuning.{name} must be greater than zero."));
            }
        }
        if t.sync_delay > t.max_sync_delay {
            errors.push(format!(
                "tuning.sync-delay ({}ms) exceeds tuning.max-sync-delay ({}ms).",
                t.sync_delay, t.max_sync_delay
            ));
        }
        if t.nsyncers == 0 {
            errors.push("tuning.nsyncers must be at least one.".to_owned());
        }
        if self.trees.backing.as_os_str().is_empty() {
            errors.push("trees.backing is empty.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The engine options this configuration asks for.
    pub fn cfs_options(&self) -> CfsOptions {
        CfsOptions {
            read_only: self.read_only,
            no_perm_check: self.no_perm_check,
            debug: self.debug,
            trace_locks: self.trace_locks,
            no_inval_proto: false,
            user: self.user.clone(),
            tuning: Tuning::from(&self.tuning),
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("zx-cfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("zx-cfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/zx-cfs/config.toml"));

        paths
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Loads the given file, or the first one found on the search path, or the defaults.
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let found = external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file);
        let config = match found {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                debug!("No configuration file found, using defaults.");
                Self::default()
            }
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            read-only = true

            [tuning]
            cache-tout = 250

            [trees]
            backing = "/srv/zx"
            "#,
        )
        .unwrap();
        assert!(config.read_only);
        assert_eq!(config.tuning.cache_tout, 250);
        assert_eq!(config.tuning.nsyncers, TuningConfig::default().nsyncers);
        assert_eq!(config.trees.backing, PathBuf::from("/srv/zx"));
        assert!(config.validate().is_ok());

        let opts = config.cfs_options();
        assert_eq!(opts.tuning.cache_tout, Duration::from_millis(250));
        assert!(opts.read_only);
    }

    #[test]
    fn every_problem_is_reported() {
        let mut config = Config::default();
        config.tuning.poll_ival = 0;
        config.tuning.sync_delay = 20_000;
        config.tuning.nsyncers = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }
}
