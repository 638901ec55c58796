//! cascade-core: directory-cascading experiment configuration and
//! reproducible code snapshots
//!
//! - [`config`] resolves the configuration of an experiment directory from
//!   fragments on the way up to the project root, evaluating `PY@`
//!   placeholders with the [`script`] interpreter.
//! - [`snapshot`] materialises pinned-revision copies of a repository on
//!   shared storage without locks.
//! - [`experiment`] ties both together for a runner.

pub mod config;
pub mod experiment;
pub mod logging;
pub mod paths;
pub mod retry;
pub mod script;
pub mod snapshot;

pub use config::{ConfigError, ConfigResolver, Mapping, Resolution, ResolverOptions};
pub use experiment::{CodeRequest, ExperimentError, PreparedExperiment};
pub use retry::{Clock, RetryPolicy, SystemClock};
pub use script::{Host, NoHost, ScriptError, ScriptEvaluator};
pub use snapshot::{RAW, Snapshot, SnapshotCache, SnapshotError, SnapshotOrigin};
