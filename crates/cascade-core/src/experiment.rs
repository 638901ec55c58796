//! Experiment preparation
//!
//! Establishes launcher settings and the workfolder, links the workfolder
//! into the experiment directory, materialises the code the experiment runs
//! against and writes the resolved configuration next to the outputs.
//! Running the experiment itself is left to the caller.

use crate::config::error::ConfigError;
use crate::config::resolve::{ConfigResolver, ResolverOptions};
use crate::config::settings::{Launch, LauncherHost};
use crate::config::Mapping;
use crate::paths;
use crate::retry::SystemClock;
use crate::script::ScriptEvaluator;
use crate::snapshot::{RAW, Snapshot, SnapshotCache, SnapshotError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Subfolder of the workfolder holding code when `checkout_to_workfolder` is set
pub const WORKFOLDER_CODE_DIR: &str = "_code";

/// Default checkout root, relative to the project root
pub const DEFAULT_CHECKOUT_DIR: &str = "checkout_temp";

/// Resolved configuration written into the prefixed workfolder
pub const FINAL_CONFIG_FILE: &str = "final_config.yml";

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A file already sits where the workfolder link belongs
    #[error("{link} exists and points to {actual}, not to {expected}")]
    Symlink {
        link: PathBuf,
        expected: PathBuf,
        actual: PathBuf,
    },

    #[error("Could not serialise final configuration: {0}")]
    Serialize(String),
}

impl ExperimentError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExperimentError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Which code the experiment runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeRequest {
    /// `code_root` as it is on disk
    Raw,
    /// A snapshot of `code_root` at this revision
    Revision(String),
}

impl CodeRequest {
    /// `None` and `"RAW"` both mean the working tree
    pub fn from_revision(revision: Option<&str>) -> Self {
        match revision {
            None | Some(RAW) => CodeRequest::Raw,
            Some(rev) => CodeRequest::Revision(rev.to_string()),
        }
    }
}

/// Everything a runner needs to start an experiment
#[derive(Debug, Clone)]
pub struct PreparedExperiment {
    pub experiment: PathBuf,
    pub project_root: PathBuf,
    pub workfolder: PathBuf,
    /// Link inside the experiment directory pointing at the workfolder
    pub symlink: PathBuf,
    /// Directory holding the code to run
    pub code_root: PathBuf,
    /// `RAW` or the canonical commit id
    pub output_prefix: String,
    /// `workfolder/output_prefix`
    pub output_dir: PathBuf,
    pub final_config: PathBuf,
    pub config: Mapping,
    pub snapshot: Option<Snapshot>,
}

/// [`prepare_with`] using `git` from the PATH and the wall clock
pub fn prepare(path: &Path, request: &CodeRequest) -> Result<PreparedExperiment, ExperimentError> {
    prepare_with(path, request, SnapshotCache::new())
}

/// Prepare the experiment at `path`.
///
/// The `post_checkout` setting, when present, replaces the hook configured
/// on `cache`.
pub fn prepare_with(
    path: &Path,
    request: &CodeRequest,
    cache: SnapshotCache,
) -> Result<PreparedExperiment, ExperimentError> {
    let mut experiment = path
        .canonicalize()
        .map_err(|e| ExperimentError::io(path, e))?;
    if experiment.is_file()
        && let Some(parent) = experiment.parent()
    {
        warn!(path = %experiment.display(), "Experiment path is a file, using its directory");
        experiment = parent.to_path_buf();
    }

    let launch = Launch::establish(&experiment)?;
    let workfolder = launch.ensure_workfolder()?;
    info!(
        experiment = %experiment.display(),
        project_root = %launch.project_root.display(),
        workfolder = %workfolder.display(),
        "Established experiment"
    );
    let symlink = link_workfolder(&launch, &workfolder)?;

    let cache = match &launch.settings.post_checkout {
        Some(command) => cache.with_post_checkout(Some(command.clone())),
        None => cache,
    };
    let (code_root, output_prefix, snapshot) = materialize_code(&launch, &workfolder, request, &cache)?;
    let output_dir = workfolder.join(&output_prefix);
    std::fs::create_dir_all(&output_dir).map_err(|e| ExperimentError::io(&output_dir, e))?;

    let host = LauncherHost;
    let clock = SystemClock;
    let resolver = ConfigResolver::with_evaluator(
        ResolverOptions::default(),
        ScriptEvaluator::new(&host, &clock),
    );
    let config = resolver.resolve(&experiment)?.into_config();

    let final_config = output_dir.join(FINAL_CONFIG_FILE);
    let body = serde_yaml::to_string(&Value::Object(config.clone()))
        .map_err(|e| ExperimentError::Serialize(e.to_string()))?;
    std::fs::write(&final_config, body).map_err(|e| ExperimentError::io(&final_config, e))?;
    info!(path = %final_config.display(), code_root = %code_root.display(), "Wrote final configuration");

    Ok(PreparedExperiment {
        project_root: launch.project_root.clone(),
        experiment,
        workfolder,
        symlink,
        code_root,
        output_prefix,
        output_dir,
        final_config,
        config,
        snapshot,
    })
}

/// Create `<experiment>/<prefix><workfolder name>` pointing at the workfolder.
///
/// An existing link to the same place is kept; anything else is an error.
fn link_workfolder(launch: &Launch, workfolder: &Path) -> Result<PathBuf, ExperimentError> {
    let name = workfolder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let link = launch
        .experiment
        .join(format!("{}{name}", launch.settings.symlink_prefix));
    let target = if launch.settings.relative_symlinks {
        paths::relative(workfolder, &launch.experiment)
    } else {
        workfolder.to_path_buf()
    };

    if link.symlink_metadata().is_ok() {
        let actual = link.canonicalize().unwrap_or_else(|_| link.clone());
        let expected = workfolder
            .canonicalize()
            .unwrap_or_else(|_| workfolder.to_path_buf());
        if actual != expected {
            return Err(ExperimentError::Symlink {
                link,
                expected,
                actual,
            });
        }
        return Ok(link);
    }
    symlink_dir(&target, &link).map_err(|e| ExperimentError::io(&link, e))?;
    info!(link = %link.display(), target = %target.display(), "Linked workfolder");
    Ok(link)
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Pick or build the code directory; returns it with the output prefix
fn materialize_code(
    launch: &Launch,
    workfolder: &Path,
    request: &CodeRequest,
    cache: &SnapshotCache,
) -> Result<(PathBuf, String, Option<Snapshot>), ExperimentError> {
    let code_root = launch.code_root()?.to_path_buf();
    info!(code_root = %code_root.display(), ?request, "Materialising code");
    let to_workfolder = launch.settings.checkout_to_workfolder;

    match request {
        CodeRequest::Raw if to_workfolder => {
            let dest = workfolder.join(WORKFOLDER_CODE_DIR);
            copy_tree(&code_root, &dest)?;
            Ok((dest, RAW.to_string(), None))
        }
        CodeRequest::Raw => {
            info!("Running raw code");
            Ok((code_root, RAW.to_string(), None))
        }
        CodeRequest::Revision(revision) => {
            let snapshot = if to_workfolder {
                let sha = cache.resolve(&code_root, revision)?;
                cache.checkout_into(&code_root, &sha, &workfolder.join(WORKFOLDER_CODE_DIR))?
            } else {
                let checkout_root = match &launch.settings.checkout_root {
                    Some(root) => root.clone(),
                    None => {
                        let root = launch.project_root.join(DEFAULT_CHECKOUT_DIR);
                        warn!(path = %root.display(), "checkout_root not set, using default");
                        root
                    }
                };
                cache.checkout(&code_root, revision, &checkout_root)?
            };
            let prefix = snapshot.revision.clone().unwrap_or_else(|| RAW.to_string());
            Ok((snapshot.path.clone(), prefix, Some(snapshot)))
        }
    }
}

/// Replace `dest` with a copy of `source`; symlinks are copied as links
fn copy_tree(source: &Path, dest: &Path) -> Result<(), ExperimentError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| ExperimentError::io(dest, e))?;
    }
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
            ExperimentError::io(path, e.into())
        })?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(rel);
        let kind = entry.file_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| ExperimentError::io(&target, e))?;
        } else if kind.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .map_err(|e| ExperimentError::io(entry.path(), e))?;
            symlink_any(&link, &target).map_err(|e| ExperimentError::io(&target, e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| ExperimentError::io(&target, e))?;
        }
    }
    info!(from = %source.display(), to = %dest.display(), "Copied raw code");
    Ok(())
}

#[cfg(unix)]
fn symlink_any(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_any(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ROOT_SENTINEL;
    use crate::config::settings::SETTINGS_FILE;
    use std::fs;
    use tempfile::TempDir;

    struct Project {
        _tmp: TempDir,
        root: PathBuf,
        exp: PathBuf,
        code: PathBuf,
    }

    fn project(settings: &str) -> Project {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let root = base.join("proj");
        let exp = root.join("group/exp1");
        let code = base.join("code");
        fs::create_dir_all(&exp).unwrap();
        fs::create_dir_all(code.join("pkg")).unwrap();
        fs::write(code.join("pkg/main.txt"), "hello").unwrap();
        fs::write(root.join(ROOT_SENTINEL), "").unwrap();
        fs::write(
            root.join(SETTINGS_FILE),
            format!(
                "output_root: '@ROOT/../out'\ncode_root: '{}'\n{settings}",
                code.display()
            ),
        )
        .unwrap();
        fs::write(
            exp.join("cfg.yml"),
            "lr: 0.1\ndata: '@ROOT/data'\nwhere: 'PY@str(exp_path.name)'\n",
        )
        .unwrap();
        Project {
            _tmp: tmp,
            root,
            exp,
            code,
        }
    }

    #[test]
    fn test_code_request_from_revision() {
        assert_eq!(CodeRequest::from_revision(None), CodeRequest::Raw);
        assert_eq!(CodeRequest::from_revision(Some("RAW")), CodeRequest::Raw);
        assert_eq!(
            CodeRequest::from_revision(Some("abc")),
            CodeRequest::Revision("abc".to_string())
        );
    }

    #[test]
    fn test_prepare_raw() {
        let p = project("");
        let prepared = prepare(&p.exp, &CodeRequest::Raw).unwrap();
        let out = p.root.parent().unwrap().join("out");
        assert_eq!(prepared.workfolder, out.join("group.exp1"));
        assert_eq!(prepared.code_root, p.code);
        assert_eq!(prepared.output_prefix, RAW);
        assert_eq!(prepared.output_dir, out.join("group.exp1/RAW"));
        assert!(prepared.snapshot.is_none());

        assert_eq!(prepared.symlink, p.exp.join("group.exp1"));
        assert_eq!(
            fs::read_link(&prepared.symlink).unwrap(),
            prepared.workfolder
        );

        let written = fs::read_to_string(&prepared.final_config).unwrap();
        assert!(written.contains("lr: 0.1"));
        assert!(written.contains("where: exp1"));
        assert_eq!(
            prepared.config["data"],
            serde_json::json!(p.root.join("data").display().to_string())
        );
    }

    #[test]
    fn test_prepare_is_repeatable() {
        let p = project("");
        let first = prepare(&p.exp, &CodeRequest::Raw).unwrap();
        let second = prepare(&p.exp, &CodeRequest::Raw).unwrap();
        assert_eq!(first.symlink, second.symlink);
    }

    #[test]
    fn test_relative_prefixed_symlink() {
        let p = project("relative_symlinks: true\nsymlink_prefix: 'out_'\n");
        let prepared = prepare(&p.exp, &CodeRequest::Raw).unwrap();
        assert_eq!(prepared.symlink, p.exp.join("out_group.exp1"));
        let target = fs::read_link(&prepared.symlink).unwrap();
        assert!(target.is_relative());
        assert_eq!(
            prepared.symlink.canonicalize().unwrap(),
            prepared.workfolder.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_foreign_symlink_is_an_error() {
        let p = project("");
        let elsewhere = p.root.join("elsewhere");
        fs::create_dir_all(&elsewhere).unwrap();
        symlink_dir(&elsewhere, &p.exp.join("group.exp1")).unwrap();
        let err = prepare(&p.exp, &CodeRequest::Raw).unwrap_err();
        assert!(matches!(err, ExperimentError::Symlink { .. }));
    }

    #[test]
    fn test_raw_copied_to_workfolder() {
        let p = project("checkout_to_workfolder: true\n");
        let prepared = prepare(&p.exp, &CodeRequest::Raw).unwrap();
        assert_eq!(prepared.code_root, prepared.workfolder.join(WORKFOLDER_CODE_DIR));
        assert_eq!(
            fs::read_to_string(prepared.code_root.join("pkg/main.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_file_path_uses_parent() {
        let p = project("");
        let prepared = prepare(&p.exp.join("cfg.yml"), &CodeRequest::Raw).unwrap();
        assert_eq!(prepared.experiment, p.exp);
    }

    #[test]
    fn test_missing_code_root() {
        let p = project("");
        fs::write(
            p.root.join(SETTINGS_FILE),
            "output_root: '@ROOT/../out'\n",
        )
        .unwrap();
        let err = prepare(&p.exp, &CodeRequest::Raw).unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::Config(ConfigError::MissingSetting { .. })
        ));
    }
}
