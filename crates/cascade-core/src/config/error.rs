//! Error types for configuration resolution

use crate::script::ScriptError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while walking, loading, merging or evaluating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Directory listing or file read failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// YAML fragment could not be parsed
    #[error("YAML parse error in {path}: {message}")]
    Yaml { path: PathBuf, message: String },

    /// TOML fragment could not be parsed
    #[error("TOML parse error in {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The same key appears twice at one nesting level of a single fragment
    #[error("Duplicate key \"{key}\" in {path}")]
    DuplicateKey { path: PathBuf, key: String },

    /// Fragment parsed, but its top level is not a mapping
    #[error("Fragment {path} must contain a mapping at the top level")]
    NotAMapping { path: PathBuf },

    /// A `PY@` placeholder that cannot be evaluated or written back
    #[error("Placeholder at '{key}' (trail level {level}) {reason}")]
    MalformedTemplate {
        key: String,
        level: usize,
        reason: &'static str,
    },

    /// The assembled evaluation unit failed to parse or run
    #[error("Evaluation failed: {source}\n--- evaluation unit ---\n{unit}")]
    Evaluation {
        source: ScriptError,
        /// Numbered source of the whole evaluation unit
        unit: String,
    },

    /// No directory between the start and the filesystem root carries the sentinel
    #[error("No {sentinel} marker found in {start} or any parent directory")]
    NoProjectRoot { start: PathBuf, sentinel: String },

    /// Launcher settings lack a value the caller needs
    #[error("Setting '{key}' is not set (add it to a cascade.yml on the way to the project root)")]
    MissingSetting { key: String },

    /// Launcher settings have the wrong shape
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}
