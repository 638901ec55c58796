//! Version-control access behind a trait, with a `git` CLI implementation

use super::error::SnapshotError;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// A nested repository pinned by its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    /// Location relative to the parent's top level
    pub path: PathBuf,
    /// Pinned commit
    pub revision: String,
}

/// Operations the snapshot cache needs from version control
pub trait Vcs: Send + Sync {
    /// Whether `path` is the top level of a repository
    fn is_repository(&self, path: &Path) -> bool;

    /// Canonical commit id for `revision`, or `None` when it does not resolve
    fn resolve_revision(&self, repo: &Path, revision: &str)
    -> Result<Option<String>, SnapshotError>;

    /// Commit checked out at `path`, or `None` when `path` is not a checkout
    fn head_revision(&self, path: &Path) -> Option<String>;

    /// Whether tracked files in `repo` have uncommitted changes
    fn is_dirty(&self, repo: &Path) -> Result<bool, SnapshotError>;

    /// Nested repositories pinned by `revision` of `repo`
    fn submodules(&self, repo: &Path, revision: &str) -> Result<Vec<Submodule>, SnapshotError>;

    /// Clone `source` into the empty directory `dest`, sharing its object
    /// store, and check out `revision` detached
    fn shared_clone(&self, source: &Path, dest: &Path, revision: &str)
    -> Result<(), SnapshotError>;
}

/// [`Vcs`] backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    /// Use a specific `git` executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<Output, SnapshotError> {
        debug!(dir = %dir.display(), args = %args.join(" "), "Running git");
        Command::new(&self.program)
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .map_err(|e| SnapshotError::io(dir, e))
    }

    fn run_ok(&self, dir: &Path, args: &[&str]) -> Result<String, SnapshotError> {
        let output = self.run(dir, args)?;
        if !output.status.success() {
            return Err(SnapshotError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Top level of the work tree containing `path`, if any
    fn toplevel(&self, path: &Path) -> Option<PathBuf> {
        if !path.is_dir() {
            return None;
        }
        let output = self.run(path, &["rev-parse", "--show-toplevel"]).ok()?;
        if !output.status.success() {
            return None;
        }
        let top = String::from_utf8_lossy(&output.stdout).trim().to_string();
        PathBuf::from(top).canonicalize().ok()
    }
}

impl Vcs for GitCli {
    fn is_repository(&self, path: &Path) -> bool {
        // A directory nested inside some other work tree does not count
        match (self.toplevel(path), path.canonicalize()) {
            (Some(top), Ok(path)) => top == path,
            _ => false,
        }
    }

    fn resolve_revision(
        &self,
        repo: &Path,
        revision: &str,
    ) -> Result<Option<String>, SnapshotError> {
        if !self.is_repository(repo) {
            return Err(SnapshotError::NotARepository {
                path: repo.to_path_buf(),
            });
        }
        let commitish = format!("{revision}^{{commit}}");
        let output = self.run(repo, &["rev-parse", "--verify", "--quiet", &commitish])?;
        if !output.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!sha.is_empty()).then_some(sha))
    }

    fn head_revision(&self, path: &Path) -> Option<String> {
        if !self.is_repository(path) {
            return None;
        }
        self.run_ok(path, &["rev-parse", "HEAD"])
            .ok()
            .filter(|sha| !sha.is_empty())
    }

    fn is_dirty(&self, repo: &Path) -> Result<bool, SnapshotError> {
        let status = self.run_ok(repo, &["status", "--porcelain", "--untracked-files=no"])?;
        Ok(!status.is_empty())
    }

    fn submodules(&self, repo: &Path, revision: &str) -> Result<Vec<Submodule>, SnapshotError> {
        let listing = self.run_ok(repo, &["ls-tree", "-r", revision])?;
        Ok(parse_gitlinks(&listing))
    }

    fn shared_clone(
        &self,
        source: &Path,
        dest: &Path,
        revision: &str,
    ) -> Result<(), SnapshotError> {
        let output = Command::new(&self.program)
            .args(["clone", "--shared", "--no-checkout", "--quiet"])
            .arg(source)
            .arg(dest)
            .output()
            .map_err(|e| SnapshotError::io(dest, e))?;
        if !output.status.success() {
            return Err(SnapshotError::Git {
                args: format!("clone --shared {} {}", source.display(), dest.display()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.run_ok(dest, &["checkout", "--quiet", "--detach", revision])?;
        Ok(())
    }
}

/// Pick gitlink entries (`160000 commit <sha>\t<path>`) out of `ls-tree` output
fn parse_gitlinks(listing: &str) -> Vec<Submodule> {
    listing
        .lines()
        .filter_map(|line| {
            let (meta, path) = line.split_once('\t')?;
            let mut fields = meta.split_whitespace();
            let (_mode, kind, sha) = (fields.next()?, fields.next()?, fields.next()?);
            (kind == "commit").then(|| Submodule {
                path: PathBuf::from(path),
                revision: sha.to_string(),
            })
        })
        .collect()
}
