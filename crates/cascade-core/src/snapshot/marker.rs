//! Completion marker written last into a finished snapshot

use super::error::SnapshotError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Marker filename
pub const MARKER_FILE: &str = "FINISHED";

/// Marker contents; informational, presence alone signals completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub revision: String,
    pub completed_at: String,
}

/// Whether `dir` carries a marker
pub fn exists(dir: &Path) -> bool {
    dir.join(MARKER_FILE).is_file()
}

/// Read the marker in `dir`, if present and well formed
pub fn read(dir: &Path) -> Option<Marker> {
    let text = std::fs::read_to_string(dir.join(MARKER_FILE)).ok()?;
    serde_yaml::from_str(&text).ok()
}

/// Write the marker atomically: temp file in `dir`, then rename
pub fn write(dir: &Path, revision: &str, now: DateTime<Local>) -> Result<(), SnapshotError> {
    let marker = Marker {
        revision: revision.to_string(),
        completed_at: now.to_rfc3339(),
    };
    let body = serde_yaml::to_string(&marker).map_err(|e| {
        SnapshotError::io(
            dir.join(MARKER_FILE),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    let temp = dir.join(format!(".{MARKER_FILE}.{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&temp, body).map_err(|e| SnapshotError::io(&temp, e))?;
    let target = dir.join(MARKER_FILE);
    std::fs::rename(&temp, &target).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        SnapshotError::io(&target, e)
    })
}
