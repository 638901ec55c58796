//! Checkout command implementation

use anyhow::Result;
use cascade_core::snapshot::GitCli;
use cascade_core::{RetryPolicy, SnapshotCache};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::LogArgs;

/// Materialise a snapshot of a repository at a revision
#[derive(Args, Debug)]
pub struct CheckoutArgs {
    /// Repository to snapshot
    repo: PathBuf,

    /// Revision to pin (commit, tag, branch, HEAD) or RAW for the working tree
    revision: String,

    /// Directory snapshots are stored under, as <root>/<repo name>/<commit>
    #[arg(long)]
    root: PathBuf,

    /// Shell command run inside a freshly built snapshot
    #[arg(long, value_name = "CMD")]
    post_checkout: Option<String>,

    /// Times to check an unfinished snapshot before building an alternate
    #[arg(long, default_value_t = 2)]
    poll_attempts: u32,

    /// Seconds between polls and between post-checkout attempts
    #[arg(long, default_value_t = 5)]
    retry_delay: u64,

    /// git executable to use
    #[arg(long, value_name = "PATH", default_value = "git")]
    git: PathBuf,

    #[command(flatten)]
    log: LogArgs,
}

/// Execute the checkout command
pub fn execute(args: CheckoutArgs) -> Result<()> {
    args.log.init();

    let delay = Duration::from_secs(args.retry_delay);
    let cache = SnapshotCache::new()
        .with_vcs(Arc::new(GitCli::with_program(args.git)))
        .with_post_checkout(args.post_checkout)
        .with_hook_retry(RetryPolicy::new(RetryPolicy::default().max_attempts, delay))
        .with_poll_retry(RetryPolicy::new(args.poll_attempts, delay));
    let snapshot = cache.checkout(&args.repo, &args.revision, &args.root)?;
    println!("{}", snapshot.path.display());
    Ok(())
}
