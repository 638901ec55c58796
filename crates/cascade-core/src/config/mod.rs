//! Cascading configuration resolution
//!
//! An experiment directory inherits configuration from every directory above
//! it up to the project root (the directory holding [`ROOT_SENTINEL`]).
//! Fragments found along the way are deep merged, deeper levels winning, and
//! `PY@` placeholders are then replaced by evaluated expressions.

pub mod error;
pub mod fragment;
pub mod merge;
pub mod resolve;
pub mod scan;
pub mod settings;
pub mod trail;

pub use error::ConfigError;
pub use fragment::{Fragment, Mapping};
pub use resolve::{ConfigResolver, Resolution, ResolverOptions, provenance, resolve};
pub use scan::SubstitutionQuery;
pub use settings::{LauncherHost, Launch, Settings};
pub use trail::{Trail, TrailLevel};

/// Marks the project root; ascension stops at the first directory holding it
pub const ROOT_SENTINEL: &str = "_ROOT";

/// Mapping fragment filenames, merged in this order when a level has several
pub const FRAGMENT_FILES: [&str; 3] = ["cfg.yml", "cfg.yaml", "cfg.toml"];

/// Script fragment filename
pub const SCRIPT_FILE: &str = "cfg.script";

/// Stops collection of mapping fragments above the directory holding it
pub const FRAGMENT_STOPPER: &str = "_ROOT_CFG";

/// Stops collection of script fragments above the directory holding it
pub const SCRIPT_STOPPER: &str = "_ROOT_SCRIPT";

/// String values starting with this are rewritten against the project root
pub const ROOT_PREFIX: &str = "@ROOT";
