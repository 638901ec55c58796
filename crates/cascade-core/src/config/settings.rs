//! Launcher settings: where outputs go and which code experiments run against
//!
//! Settings cascade like experiment configuration but from `cascade.yml`
//! files only, over a fixed baseline, with no placeholder evaluation.

use super::error::ConfigError;
use super::fragment::{self, Mapping, parse_yaml};
use super::merge::merge_all;
use super::resolve::replace_root_prefix;
use super::trail::{self, Trail};
use super::ROOT_SENTINEL;
use crate::script::Host;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::iter::once;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Settings fragment filename
pub const SETTINGS_FILE: &str = "cascade.yml";

const BASELINE: &str = "\
output_root: ~
checkout_root: ~
code_root: ~
post_checkout: ~
checkout_to_workfolder: false
relative_symlinks: false
symlink_prefix: ''
run: ~
";

/// Merged launcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Where heavy outputs (workfolders) are stored
    pub output_root: Option<PathBuf>,
    /// Where code snapshots are materialised
    pub checkout_root: Option<PathBuf>,
    /// Repository the experiments run against
    pub code_root: Option<PathBuf>,
    /// Shell command run inside a fresh snapshot
    pub post_checkout: Option<String>,
    #[serde(default)]
    pub checkout_to_workfolder: bool,
    #[serde(default)]
    pub relative_symlinks: bool,
    #[serde(default)]
    pub symlink_prefix: String,
    /// Entry point name, passed through untouched
    pub run: Option<Value>,
    /// Keys this crate does not interpret
    #[serde(flatten)]
    pub extra: Mapping,
}

/// The baseline every settings cascade starts from
pub fn baseline() -> Result<Mapping, ConfigError> {
    parse_yaml(BASELINE, Path::new("<baseline settings>"))
}

/// Settings established for one experiment directory
#[derive(Debug, Clone)]
pub struct Launch {
    pub settings: Settings,
    /// Deepest directory holding the root sentinel
    pub project_root: PathBuf,
    /// Canonical experiment directory
    pub experiment: PathBuf,
    pub trail: Trail,
}

impl Launch {
    /// Walk from `experiment` to the project root and merge every `cascade.yml`
    pub fn establish(experiment: &Path) -> Result<Self, ConfigError> {
        let trail = trail::walk(experiment, ROOT_SENTINEL)?;
        let project_root = trail
            .levels()
            .last()
            .filter(|l| l.contains(ROOT_SENTINEL))
            .map(|l| l.dir.clone())
            .ok_or_else(|| ConfigError::NoProjectRoot {
                start: experiment.to_path_buf(),
                sentinel: ROOT_SENTINEL.to_string(),
            })?;
        let experiment = trail
            .head()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| experiment.to_path_buf());

        let fragments = fragment::load(&trail, &trail, &[SETTINGS_FILE])?;
        let base = baseline()?;
        let mut merged = merge_all(once(&base).chain(fragments.values().map(|f| &f.values)));
        replace_root_prefix(&mut merged, &project_root);
        let settings: Settings = serde_json::from_value(Value::Object(merged))
            .map_err(|e| ConfigError::InvalidSettings(e.to_string()))?;
        debug!(
            project_root = %project_root.display(),
            files = fragments.len(),
            "Established launcher settings"
        );
        Ok(Self {
            settings,
            project_root,
            experiment,
            trail,
        })
    }

    /// `output_root`, or an error naming the missing key
    pub fn output_root(&self) -> Result<&Path, ConfigError> {
        self.settings
            .output_root
            .as_deref()
            .ok_or_else(|| ConfigError::MissingSetting {
                key: "output_root".to_string(),
            })
    }

    /// `code_root`, or an error naming the missing key
    pub fn code_root(&self) -> Result<&Path, ConfigError> {
        self.settings
            .code_root
            .as_deref()
            .ok_or_else(|| ConfigError::MissingSetting {
                key: "code_root".to_string(),
            })
    }

    /// Output folder name: the experiment path relative to the project root
    /// with separators replaced by dots
    pub fn workfolder_name(&self) -> String {
        let rel = self
            .experiment
            .strip_prefix(&self.project_root)
            .unwrap_or(&self.experiment);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Where this experiment's outputs go; not created
    pub fn workfolder(&self) -> Result<PathBuf, ConfigError> {
        let name = self.workfolder_name();
        let output_root = self.output_root()?;
        Ok(if name.is_empty() {
            output_root.to_path_buf()
        } else {
            output_root.join(name)
        })
    }

    /// [`workfolder`](Self::workfolder), created if missing
    pub fn ensure_workfolder(&self) -> Result<PathBuf, ConfigError> {
        let workfolder = self.workfolder()?;
        std::fs::create_dir_all(&workfolder).map_err(|e| ConfigError::io(&workfolder, e))?;
        Ok(workfolder)
    }
}

/// Looks up other experiments' workfolders through their launcher settings
#[derive(Debug, Default, Clone, Copy)]
pub struct LauncherHost;

impl Host for LauncherHost {
    fn workfolder(&self, experiment: &Path) -> Result<PathBuf, String> {
        Launch::establish(experiment)
            .and_then(|launch| launch.workfolder())
            .map_err(|e| e.to_string())
    }
}
