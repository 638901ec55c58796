//! Ascension trail: the directories between an experiment and its project root
//!
//! A trail is built by listing the starting directory and each of its parents
//! until a directory containing the stop filename is found (inclusive) or the
//! filesystem root is reached. Levels are stored deepest-first; level numbers
//! handed out by [`Trail::shallow_first`] count from the shallowest directory.

use super::error::ConfigError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One directory on the trail together with its listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailLevel {
    /// Absolute directory path
    pub dir: PathBuf,
    /// File and directory names found in `dir`, sorted
    pub entries: Vec<String>,
}

impl TrailLevel {
    /// Whether the listing contains `name`
    pub fn contains(&self, name: &str) -> bool {
        self.entries.binary_search_by(|e| e.as_str().cmp(name)).is_ok()
    }
}

/// Ordered directories from the starting point up to the stop marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trail {
    /// Deepest first
    levels: Vec<TrailLevel>,
}

/// Walk upward from `start` until a directory lists `stop_filename`.
///
/// `start` itself is the first level. Reaching the filesystem root without
/// seeing the stop marker is not an error; the trail simply ends there.
pub fn walk(start: &Path, stop_filename: &str) -> Result<Trail, ConfigError> {
    let start = start
        .canonicalize()
        .map_err(|e| ConfigError::io(start, e))?;

    let mut levels = Vec::new();
    for dir in start.ancestors() {
        let entries = list_dir(dir)?;
        let level = TrailLevel {
            dir: dir.to_path_buf(),
            entries,
        };
        let stop = level.contains(stop_filename);
        levels.push(level);
        if stop {
            debug!(dir = %dir.display(), stop_filename, "Trail reached stop marker");
            return Ok(Trail { levels });
        }
    }

    debug!(start = %start.display(), stop_filename, "Trail reached filesystem root without stop marker");
    Ok(Trail { levels })
}

fn list_dir(dir: &Path) -> Result<Vec<String>, ConfigError> {
    let reader = std::fs::read_dir(dir).map_err(|e| ConfigError::io(dir, e))?;
    let mut entries = Vec::new();
    for entry in reader {
        let entry = entry.map_err(|e| ConfigError::io(dir, e))?;
        entries.push(entry.file_name().to_string_lossy().into_owned());
    }
    entries.sort();
    Ok(entries)
}

impl Trail {
    /// Build a trail from explicit levels, deepest first
    pub fn from_levels(levels: Vec<TrailLevel>) -> Self {
        Self { levels }
    }

    /// Levels ordered deepest-first
    pub fn levels(&self) -> &[TrailLevel] {
        &self.levels
    }

    /// Levels ordered shallowest-first, paired with their level number
    pub fn shallow_first(&self) -> impl Iterator<Item = (usize, &TrailLevel)> {
        self.levels.iter().rev().enumerate()
    }

    /// Number of levels
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the trail has no levels
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// The starting (deepest) directory
    pub fn head(&self) -> Option<&Path> {
        self.levels.first().map(|l| l.dir.as_path())
    }

    /// The shallowest directory, i.e. the project root when the stop marker was found
    pub fn root(&self) -> Option<&Path> {
        self.levels.last().map(|l| l.dir.as_path())
    }

    /// Cut the trail at the deepest directory listing `stopper` (inclusive).
    ///
    /// Used to confine one kind of fragment to a sub-tree without moving the
    /// project root. When no level lists `stopper` the trail is returned unchanged.
    pub fn cut_at(&self, stopper: &str) -> Trail {
        let mut levels = Vec::new();
        for level in &self.levels {
            levels.push(level.clone());
            if level.contains(stopper) {
                info!(dir = %level.dir.display(), stopper, "Trail stopped early by stopper");
                break;
            }
        }
        Trail { levels }
    }

    /// Paths of `filename` on every level that lists it, shallowest first
    pub fn matching(&self, filename: &str) -> Vec<(usize, PathBuf)> {
        self.shallow_first()
            .filter(|(_, level)| level.contains(filename))
            .map(|(n, level)| (n, level.dir.join(filename)))
            .collect()
    }

    /// Level number (shallow-first) of `dir`, if it is on the trail
    pub fn level_of(&self, dir: &Path) -> Option<usize> {
        self.shallow_first()
            .find(|(_, level)| level.dir == dir)
            .map(|(n, _)| n)
    }
}
