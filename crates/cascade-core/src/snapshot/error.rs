//! Error types for snapshot materialisation

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while materialising a code snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The revision does not name a commit in the repository
    #[error("Revision '{revision}' not found in {repo}")]
    RevisionNotFound { repo: PathBuf, revision: String },

    /// The path is not the top level of a repository
    #[error("{path} is not a repository")]
    NotARepository { path: PathBuf },

    /// `HEAD` was requested while the working tree has uncommitted changes
    #[error(
        "Refusing to snapshot HEAD of {repo}: the working tree has uncommitted changes (commit them, pass an explicit revision, or use RAW)"
    )]
    DirtyHead { repo: PathBuf },

    /// A pinned submodule has no checkout in the source repository
    #[error(
        "Submodule {path} of {repo} is not initialised (run `git submodule update --init --recursive` there)"
    )]
    SubmoduleMissing { repo: PathBuf, path: PathBuf },

    /// A version-control command exited unsuccessfully
    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },

    /// The post-checkout command kept failing
    #[error("Post-checkout command `{command}` failed after {attempts} attempts:\n{output}")]
    PostCheckoutFailed {
        command: String,
        attempts: u32,
        output: String,
    },

    /// Filesystem or process spawn failure
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SnapshotError::Io {
            path: path.into(),
            source,
        }
    }
}
