//! Reproducible code snapshots on shared storage
//!
//! A snapshot of `repo` at a revision lives at
//! `target_root/<repo name>/<commit id>`. Several processes may ask for the
//! same snapshot at once; there is no lock. The first to create the
//! directory builds it and writes the completion marker last. Everyone else
//! polls for the marker and, if it never shows up, builds a private
//! alternate copy next to it instead. The deterministic directory is only
//! ever created by its builder, never deleted or rebuilt by anyone else.

pub mod error;
pub mod marker;
pub mod vcs;

pub use error::SnapshotError;
pub use vcs::{GitCli, Submodule, Vcs};

use crate::retry::{Clock, RetryPolicy, SystemClock};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Revision meaning "use the working tree as it is"
pub const RAW: &str = "RAW";

/// Suffix of alternate snapshot directories
pub const ALTERNATE_SUFFIX: &str = ".alt";

const ALTERNATE_SHA_LEN: usize = 12;

/// How a snapshot path was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// `RAW`: the repository itself, nothing copied
    Raw,
    /// Built now in the deterministic directory
    Created,
    /// Found complete in the deterministic directory
    Existing,
    /// Found complete in an earlier alternate directory
    ReusedAlternate,
    /// Built now in a fresh alternate directory
    Alternate,
}

/// A usable code snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    /// Canonical commit id; `None` for `RAW`
    pub revision: Option<String>,
    pub origin: SnapshotOrigin,
}

/// Materialises pinned-revision copies of repositories
pub struct SnapshotCache {
    vcs: Arc<dyn Vcs>,
    clock: Arc<dyn Clock>,
    post_checkout: Option<String>,
    hook_retry: RetryPolicy,
    poll_retry: RetryPolicy,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    /// `git` on the PATH, wall clock, default retry policies, no hook
    pub fn new() -> Self {
        Self {
            vcs: Arc::new(GitCli::default()),
            clock: Arc::new(SystemClock),
            post_checkout: None,
            hook_retry: RetryPolicy::default(),
            poll_retry: RetryPolicy::default(),
        }
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn Vcs>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shell command run inside every freshly built snapshot
    pub fn with_post_checkout(mut self, command: Option<String>) -> Self {
        self.post_checkout = command.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_hook_retry(mut self, policy: RetryPolicy) -> Self {
        self.hook_retry = policy;
        self
    }

    pub fn with_poll_retry(mut self, policy: RetryPolicy) -> Self {
        self.poll_retry = policy;
        self
    }

    /// Resolve `revision` to a commit id, refusing `HEAD` of a dirty tree
    pub fn resolve(&self, repo: &Path, revision: &str) -> Result<String, SnapshotError> {
        let sha = self
            .vcs
            .resolve_revision(repo, revision)?
            .ok_or_else(|| SnapshotError::RevisionNotFound {
                repo: repo.to_path_buf(),
                revision: revision.to_string(),
            })?;
        if revision == "HEAD" && self.vcs.is_dirty(repo)? {
            return Err(SnapshotError::DirtyHead {
                repo: repo.to_path_buf(),
            });
        }
        info!(repo = %repo.display(), revision, sha = %sha, "Resolved revision");
        Ok(sha)
    }

    /// Snapshot of `repo` at `revision` under `target_root/<repo name>/`.
    ///
    /// The revision is resolved before anything is created on disk.
    pub fn checkout(
        &self,
        repo: &Path,
        revision: &str,
        target_root: &Path,
    ) -> Result<Snapshot, SnapshotError> {
        if revision == RAW {
            info!(repo = %repo.display(), "Using raw working tree, no checkout");
            return Ok(Snapshot {
                path: repo.to_path_buf(),
                revision: None,
                origin: SnapshotOrigin::Raw,
            });
        }
        let sha = self.resolve(repo, revision)?;
        let name = repo_name(repo)?;
        self.checkout_into(repo, &sha, &target_root.join(name).join(&sha))
    }

    /// Snapshot of `repo` at the already resolved commit `sha`, at `slot`.
    ///
    /// Alternates, if needed, are created next to `slot`.
    pub fn checkout_into(
        &self,
        repo: &Path,
        sha: &str,
        slot: &Path,
    ) -> Result<Snapshot, SnapshotError> {
        let parent = slot.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| SnapshotError::io(parent, e))?;

        match std::fs::create_dir(slot) {
            Ok(()) => {
                info!(slot = %slot.display(), sha, "Claimed snapshot directory, building");
                self.build(repo, sha, slot)?;
                return Ok(self.snapshot(slot, sha, SnapshotOrigin::Created));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(SnapshotError::io(slot, e)),
        }

        info!(slot = %slot.display(), "Snapshot directory exists, waiting for it to complete");
        if self
            .poll_retry
            .poll(self.clock.as_ref(), "Snapshot completion", || {
                self.is_complete(slot, sha)
            })
        {
            info!(slot = %slot.display(), "Found complete snapshot");
            return Ok(self.snapshot(slot, sha, SnapshotOrigin::Existing));
        }

        warn!(
            slot = %slot.display(),
            attempts = self.poll_retry.max_attempts,
            "Snapshot did not complete in time, falling back to an alternate directory"
        );
        if let Some(found) = self.find_alternate(parent, sha) {
            info!(path = %found.display(), "Reusing complete alternate snapshot");
            return Ok(self.snapshot(&found, sha, SnapshotOrigin::ReusedAlternate));
        }
        let alternate = self.create_alternate(parent, sha)?;
        info!(path = %alternate.display(), "Building alternate snapshot");
        self.build(repo, sha, &alternate)?;
        Ok(self.snapshot(&alternate, sha, SnapshotOrigin::Alternate))
    }

    /// A directory holds a usable snapshot of `sha`: it is a checkout, pinned
    /// to `sha`, and carries the completion marker
    pub fn is_complete(&self, dir: &Path, sha: &str) -> bool {
        if !marker::exists(dir) {
            debug!(dir = %dir.display(), "No completion marker");
            return false;
        }
        match self.vcs.head_revision(dir) {
            Some(head) if head == sha => true,
            Some(head) => {
                debug!(dir = %dir.display(), head = %head, expected = sha, "Snapshot pinned to another revision");
                false
            }
            None => {
                debug!(dir = %dir.display(), "Not a checkout");
                false
            }
        }
    }

    fn snapshot(&self, path: &Path, sha: &str, origin: SnapshotOrigin) -> Snapshot {
        Snapshot {
            path: path.to_path_buf(),
            revision: Some(sha.to_string()),
            origin,
        }
    }

    fn build(&self, repo: &Path, sha: &str, dir: &Path) -> Result<(), SnapshotError> {
        let result = self
            .vcs
            .shared_clone(repo, dir, sha)
            .and_then(|()| self.materialize_submodules(repo, dir, sha))
            .and_then(|()| self.run_post_checkout(dir))
            .and_then(|()| marker::write(dir, sha, self.clock.now()));
        match &result {
            Ok(()) => info!(dir = %dir.display(), sha, "Snapshot complete"),
            Err(e) => error!(dir = %dir.display(), sha, "Snapshot build failed, left without completion marker: {e}"),
        }
        result
    }

    fn materialize_submodules(
        &self,
        source: &Path,
        dest: &Path,
        sha: &str,
    ) -> Result<(), SnapshotError> {
        for sub in self.vcs.submodules(source, sha)? {
            let sub_source = source.join(&sub.path);
            let sub_dest = dest.join(&sub.path);
            if !self.vcs.is_repository(&sub_source) {
                return Err(SnapshotError::SubmoduleMissing {
                    repo: source.to_path_buf(),
                    path: sub.path,
                });
            }
            debug!(submodule = %sub.path.display(), revision = %sub.revision, "Cloning submodule");
            self.vcs.shared_clone(&sub_source, &sub_dest, &sub.revision)?;
            self.materialize_submodules(&sub_source, &sub_dest, &sub.revision)?;
        }
        Ok(())
    }

    fn run_post_checkout(&self, dir: &Path) -> Result<(), SnapshotError> {
        let Some(command) = &self.post_checkout else {
            return Ok(());
        };
        let output = self
            .hook_retry
            .run(self.clock.as_ref(), "Post-checkout command", |attempt| {
                debug!(attempt, command = %command, dir = %dir.display(), "Running post-checkout command");
                run_shell(command, dir)
            })
            .map_err(|(output, attempts)| SnapshotError::PostCheckoutFailed {
                command: command.clone(),
                attempts,
                output,
            })?;
        info!(command = %command, dir = %dir.display(), "Post-checkout command succeeded");
        debug!("Post-checkout output:\n{output}");
        Ok(())
    }

    /// A complete alternate of `sha` left by an earlier fallback
    fn find_alternate(&self, parent: &Path, sha: &str) -> Option<PathBuf> {
        let tag = format!("_{}_", short(sha));
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(parent)
            .ok()?
            .filter_map(Result::ok)
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.ends_with(ALTERNATE_SUFFIX) && name.contains(&tag)
            })
            .map(|e| e.path())
            .collect();
        candidates.sort();
        candidates.into_iter().find(|p| self.is_complete(p, sha))
    }

    /// Fresh `<time>_<sha prefix>_<random>.alt` sibling directory
    fn create_alternate(&self, parent: &Path, sha: &str) -> Result<PathBuf, SnapshotError> {
        let stamp = self.clock.now().format("%Y-%m-%d_%H-%M");
        loop {
            let random = Uuid::new_v4().simple().to_string();
            let name = format!("{stamp}_{}_{}{ALTERNATE_SUFFIX}", short(sha), &random[..8]);
            let path = parent.join(name);
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(SnapshotError::io(&path, e)),
            }
        }
    }
}

fn short(sha: &str) -> &str {
    sha.get(..ALTERNATE_SHA_LEN).unwrap_or(sha)
}

fn repo_name(repo: &Path) -> Result<String, SnapshotError> {
    let canonical = repo
        .canonicalize()
        .map_err(|e| SnapshotError::io(repo, e))?;
    canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SnapshotError::NotARepository {
            path: repo.to_path_buf(),
        })
}

/// Run `command` with bash in `dir`; stdout and stderr are returned together
fn run_shell(command: &str, dir: &Path) -> Result<String, String> {
    let output = Command::new("bash")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .output()
        .map_err(|e| format!("could not start bash: {e}"))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let text = text.trim().to_string();
    if output.status.success() {
        Ok(text)
    } else {
        Err(format!("{} ({})", text, output.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::test_support::RecordingClock;
    use chrono::Local;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const SHA: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    /// Checkouts are directories holding a `HEAD_REV` file
    #[derive(Default)]
    struct FakeVcs {
        revisions: HashMap<String, String>,
        dirty: bool,
        clones: Mutex<Vec<PathBuf>>,
    }

    impl FakeVcs {
        fn with_revision(name: &str, sha: &str) -> Self {
            let mut vcs = Self::default();
            vcs.revisions.insert(name.to_string(), sha.to_string());
            vcs
        }

        fn clones(&self) -> Vec<PathBuf> {
            self.clones.lock().unwrap().clone()
        }
    }

    impl Vcs for FakeVcs {
        fn is_repository(&self, path: &Path) -> bool {
            path.join("HEAD_REV").exists()
        }

        fn resolve_revision(
            &self,
            _repo: &Path,
            revision: &str,
        ) -> Result<Option<String>, SnapshotError> {
            Ok(self.revisions.get(revision).cloned())
        }

        fn head_revision(&self, path: &Path) -> Option<String> {
            std::fs::read_to_string(path.join("HEAD_REV")).ok()
        }

        fn is_dirty(&self, _repo: &Path) -> Result<bool, SnapshotError> {
            Ok(self.dirty)
        }

        fn submodules(&self, _repo: &Path, _revision: &str) -> Result<Vec<Submodule>, SnapshotError> {
            Ok(Vec::new())
        }

        fn shared_clone(
            &self,
            _source: &Path,
            dest: &Path,
            revision: &str,
        ) -> Result<(), SnapshotError> {
            std::fs::create_dir_all(dest).map_err(|e| SnapshotError::io(dest, e))?;
            std::fs::write(dest.join("HEAD_REV"), revision).map_err(|e| SnapshotError::io(dest, e))?;
            self.clones.lock().unwrap().push(dest.to_path_buf());
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        repo: PathBuf,
        root: PathBuf,
        vcs: Arc<FakeVcs>,
        clock: Arc<RecordingClock>,
    }

    fn fixture(vcs: FakeVcs) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("myrepo");
        std::fs::create_dir_all(&repo).unwrap();
        let root = tmp.path().join("checkouts");
        Fixture {
            repo,
            root,
            _tmp: tmp,
            vcs: Arc::new(vcs),
            clock: Arc::new(RecordingClock::default()),
        }
    }

    fn cache(f: &Fixture) -> SnapshotCache {
        SnapshotCache::new()
            .with_vcs(f.vcs.clone())
            .with_clock(f.clock.clone())
    }

    #[test]
    fn test_raw_returns_repo_untouched() {
        let f = fixture(FakeVcs::default());
        let snap = cache(&f).checkout(&f.repo, RAW, &f.root).unwrap();
        assert_eq!(snap.path, f.repo);
        assert_eq!(snap.origin, SnapshotOrigin::Raw);
        assert!(!f.root.exists());
    }

    #[test]
    fn test_fresh_checkout_writes_marker() {
        let f = fixture(FakeVcs::with_revision("v1", SHA));
        let snap = cache(&f).checkout(&f.repo, "v1", &f.root).unwrap();
        assert_eq!(snap.path, f.root.join("myrepo").join(SHA));
        assert_eq!(snap.origin, SnapshotOrigin::Created);
        assert_eq!(snap.revision.as_deref(), Some(SHA));
        assert!(marker::exists(&snap.path));
        assert_eq!(marker::read(&snap.path).unwrap().revision, SHA);
    }

    #[test]
    fn test_second_checkout_reuses_existing() {
        let f = fixture(FakeVcs::with_revision("v1", SHA));
        let c = cache(&f);
        let first = c.checkout(&f.repo, "v1", &f.root).unwrap();
        let second = c.checkout(&f.repo, "v1", &f.root).unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(second.origin, SnapshotOrigin::Existing);
        assert_eq!(f.vcs.clones().len(), 1);
        assert!(f.clock.sleeps().is_empty());
    }

    #[test]
    fn test_unknown_revision_creates_nothing() {
        let f = fixture(FakeVcs::default());
        let err = cache(&f).checkout(&f.repo, "nope", &f.root).unwrap_err();
        assert!(matches!(err, SnapshotError::RevisionNotFound { .. }));
        assert!(!f.root.exists());
    }

    #[test]
    fn test_dirty_head_refused() {
        let mut vcs = FakeVcs::with_revision("HEAD", SHA);
        vcs.dirty = true;
        let f = fixture(vcs);
        let err = cache(&f).checkout(&f.repo, "HEAD", &f.root).unwrap_err();
        assert!(matches!(err, SnapshotError::DirtyHead { .. }));
        assert!(!f.root.exists());
    }

    #[test]
    fn test_stale_directory_falls_back_to_alternate() {
        let f = fixture(FakeVcs::with_revision("v1", SHA));
        let slot = f.root.join("myrepo").join(SHA);
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join("garbage"), "half written").unwrap();

        let c = cache(&f).with_poll_retry(RetryPolicy::new(3, Duration::from_secs(5)));
        let snap = c.checkout(&f.repo, "v1", &f.root).unwrap();
        assert_eq!(snap.origin, SnapshotOrigin::Alternate);
        assert_ne!(snap.path, slot);
        assert_eq!(snap.path.parent(), slot.parent());
        let name = snap.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(ALTERNATE_SUFFIX));
        assert!(name.contains(&SHA[..12]));
        assert!(c.is_complete(&snap.path, SHA));
        assert_eq!(f.clock.sleeps(), vec![Duration::from_secs(5); 3]);
        // the abandoned slot is left alone
        assert!(slot.join("garbage").exists());
        assert!(!marker::exists(&slot));
    }

    #[test]
    fn test_complete_alternate_is_reused() {
        let f = fixture(FakeVcs::with_revision("v1", SHA));
        let slot = f.root.join("myrepo").join(SHA);
        std::fs::create_dir_all(&slot).unwrap();
        let c = cache(&f).with_poll_retry(RetryPolicy::once());

        let first = c.checkout(&f.repo, "v1", &f.root).unwrap();
        let second = c.checkout(&f.repo, "v1", &f.root).unwrap();
        assert_eq!(first.origin, SnapshotOrigin::Alternate);
        assert_eq!(second.origin, SnapshotOrigin::ReusedAlternate);
        assert_eq!(first.path, second.path);
        assert_eq!(f.vcs.clones().len(), 1);
    }

    #[test]
    fn test_wrong_revision_in_slot_is_not_accepted() {
        let f = fixture(FakeVcs::with_revision("v1", SHA));
        let slot = f.root.join("myrepo").join(SHA);
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join("HEAD_REV"), "0000").unwrap();
        marker::write(&slot, "0000", Local::now()).unwrap();

        let c = cache(&f).with_poll_retry(RetryPolicy::once());
        assert!(!c.is_complete(&slot, SHA));
        let snap = c.checkout(&f.repo, "v1", &f.root).unwrap();
        assert_eq!(snap.origin, SnapshotOrigin::Alternate);
    }

    #[test]
    fn test_post_checkout_retried_then_succeeds() {
        let f = fixture(FakeVcs::with_revision("v1", SHA));
        let c = cache(&f)
            .with_post_checkout(Some("test -f .tried || { touch .tried; exit 1; }".to_string()))
            .with_hook_retry(RetryPolicy::new(2, Duration::from_secs(5)));
        let snap = c.checkout(&f.repo, "v1", &f.root).unwrap();
        assert!(snap.path.join(".tried").exists());
        assert!(marker::exists(&snap.path));
        assert_eq!(f.clock.sleeps(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn test_post_checkout_exhausted_is_fatal() {
        let f = fixture(FakeVcs::with_revision("v1", SHA));
        let c = cache(&f)
            .with_post_checkout(Some("echo boom; exit 3".to_string()))
            .with_hook_retry(RetryPolicy::new(2, Duration::from_secs(5)));
        let err = c.checkout(&f.repo, "v1", &f.root).unwrap_err();
        let SnapshotError::PostCheckoutFailed {
            attempts, output, ..
        } = err
        else {
            panic!("expected post-checkout failure");
        };
        assert_eq!(attempts, 2);
        assert!(output.contains("boom"));
        assert!(!marker::exists(&f.root.join("myrepo").join(SHA)));
    }

}
