//! Configuration parsing.
//!
//! key=value format, `#` comments, optional quotes around values.
//! Precedence: CLI flags > `--config` file > `<project>/.forge/config` > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Directory for forge's own files inside a project. Never visible to the oracle.
pub const STATE_DIR: &str = ".forge";

/// Per-project config file, relative to the project root.
pub const PROJECT_CONFIG_PATH: &str = ".forge/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Run configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Oracle
    /// Shell command that receives the prompt on stdin and prints the response.
    pub oracle_cmd: String,
    pub oracle_timeout_sec: u32,
    pub oracle_attempts: u32,
    pub oracle_backoff_ms: u64,
    /// Directory to store prompts and responses of failed oracle calls.
    pub failure_dir: Option<PathBuf>,

    // Iteration budget
    pub max_iterations: u32,
    pub selector_iterations: u32,
    pub max_files: usize,
    pub max_total_size: usize,

    // Toolchain
    pub command_timeout_sec: u32,
    pub package_manager: String,
    pub standard_cmds: Vec<String>,
    pub dependency_dir: String,
    pub ignored_dirs: Vec<String>,

    // Interaction and output
    pub enable_questions: bool,
    pub history_file: PathBuf,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oracle_cmd: "claude -p".to_string(),
            oracle_timeout_sec: 600,
            oracle_attempts: 3,
            oracle_backoff_ms: 1000,
            failure_dir: None,
            max_iterations: 10,
            selector_iterations: 5,
            max_files: 30,
            max_total_size: 100_000,
            command_timeout_sec: 120,
            package_manager: "yarn".to_string(),
            standard_cmds: vec!["yarn tsc".to_string(), "yarn jest".to_string()],
            dependency_dir: "node_modules".to_string(),
            ignored_dirs: ["node_modules", ".git", "dist", "build", "target"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            enable_questions: true,
            history_file: PathBuf::from(STATE_DIR).join("task_history.tsv"),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `<project>/.forge/config` when present, otherwise defaults.
    pub fn for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let path = project_root.join(PROJECT_CONFIG_PATH);
        if path.is_file() {
            config.load_file(&path)?;
        }
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "oracle_cmd" => self.oracle_cmd = value.to_string(),
            "oracle_timeout_sec" => self.oracle_timeout_sec = Self::parse_int(key, value)?,
            "oracle_attempts" => self.oracle_attempts = Self::parse_int(key, value)?,
            "oracle_backoff_ms" => self.oracle_backoff_ms = Self::parse_int(key, value)?,
            "failure_dir" => {
                self.failure_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "max_iterations" => self.max_iterations = Self::parse_int(key, value)?,
            "selector_iterations" => self.selector_iterations = Self::parse_int(key, value)?,
            "max_files" => self.max_files = Self::parse_int(key, value)?,
            "max_total_size" => self.max_total_size = Self::parse_int(key, value)?,
            "command_timeout_sec" => self.command_timeout_sec = Self::parse_int(key, value)?,
            "package_manager" => self.package_manager = value.to_string(),
            "standard_cmds" => {
                // Pipe-separated list of commands
                self.standard_cmds = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "dependency_dir" => self.dependency_dir = value.to_string(),
            "ignored_dirs" => {
                self.ignored_dirs = value.split_whitespace().map(ToString::to_string).collect();
            }
            "enable_questions" => self.enable_questions = Self::parse_bool(key, value)?,
            "history_file" => self.history_file = PathBuf::from(value),
            "log_filter" => self.log_filter = value.to_string(),
            _ => {
                warn!(key, source, "unknown config key, ignoring");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against the project root.
    pub fn resolve_paths(&mut self, project_root: &Path) {
        if self.history_file.is_relative() {
            self.history_file = project_root.join(&self.history_file);
        }
        if let Some(ref failure_dir) = self.failure_dir {
            if failure_dir.is_relative() {
                self.failure_dir = Some(project_root.join(failure_dir));
            }
        }
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.oracle_timeout_sec))
    }

    pub fn oracle_backoff(&self) -> Duration {
        Duration::from_millis(self.oracle_backoff_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.command_timeout_sec))
    }
}
