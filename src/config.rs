//! Application configuration.
//!
//! Configuration is read from `image-lock.yaml` in the working directory
//! (or the file named by `--config`) and includes:
//! - Scan root, ledger location and output directory
//! - Debounce window and action concurrency
//! - Which file time serves as the freshness token
//! - External command definitions for named actions
//!
//! Command-line flags override values from the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ImageLockError, Result};
use crate::token::TokenField;
use crate::types::{DEFAULT_LEDGER_FILE, DEFAULT_ROOT};

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "image-lock.yaml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory tree to reconcile (default: ./images)
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Where the ledger is persisted (default: ./image-lock.json)
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,

    /// Quiet period before a watch-triggered pass, in milliseconds (default: 100)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Maximum number of action invocations in flight (default: 8)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// File time used as the freshness token (default: modified)
    #[serde(default)]
    pub token_field: TokenField,

    /// Destination tree for derived artifacts (default: build)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Extra attempts after a failed ledger write (default: 2)
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,

    /// Actions implemented by external commands
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, ActionDefinition>,
}

/// An action implemented by an external command.
///
/// Arguments may contain `{path}` (the file on disk), `{key}` (the ledger
/// key) and `{output}` (the configured output directory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Program followed by its arguments
    pub command: Vec<String>,

    /// Timeout in seconds (default: none)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_ledger() -> PathBuf {
    PathBuf::from(DEFAULT_LEDGER_FILE)
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_concurrency() -> usize {
    8
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("build")
}

fn default_persist_retries() -> u32 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            ledger: default_ledger(),
            debounce_ms: default_debounce_ms(),
            concurrency: default_concurrency(),
            token_field: TokenField::default(),
            output_dir: default_output_dir(),
            persist_retries: default_persist_retries(),
            actions: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist. Without one,
    /// `image-lock.yaml` is used when present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() {
            if required {
                return Err(ImageLockError::Config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            ImageLockError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config at {}: {}", path.display(), e),
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ImageLockError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        for (name, definition) in &self.actions {
            if name.trim().is_empty() {
                return Err(ImageLockError::Config(
                    "action names must not be empty".to_string(),
                ));
            }
            if definition.command.first().is_none_or(|p| p.trim().is_empty()) {
                return Err(ImageLockError::Config(format!(
                    "action '{name}' has an empty command"
                )));
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Everything a run needs: the action plus the resolved configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Action applied to every file
    pub action: String,
    /// Verbose per-decision logging, no progress line
    pub debug: bool,
    /// Keep running and re-reconcile on filesystem changes
    pub watch: bool,
    /// Start from an empty ledger if the stored one is corrupt
    pub fresh: bool,
    /// Print the run summary as JSON
    pub json: bool,
    pub settings: Config,
}

impl RunConfig {
    pub fn new(action: impl Into<String>, settings: Config) -> Result<Self> {
        let action = action.into();
        if action.trim().is_empty() {
            return Err(ImageLockError::Config(
                "action name must not be empty".to_string(),
            ));
        }
        settings.validate()?;
        Ok(RunConfig {
            action,
            debug: false,
            watch: false,
            fresh: false,
            json: false,
            settings,
        })
    }
}
