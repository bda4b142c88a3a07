use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const PENDING_FILE: &str = "rj_pending_segment.json";

/// Metadata persisted by the emergency flush so the segment that was open
/// when the process died can be replayed on the next launch.
///
/// `finalized` records whether the container index was written; the uploader
/// replays the artifact either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSegment {
    pub segment_path: PathBuf,
    pub session_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub frame_count: u32,
    pub finalized: bool,
}

pub fn pending_metadata_path(caches_dir: &Path) -> PathBuf {
    caches_dir.join(PENDING_FILE)
}

/// Writes the recovery record. Called only from the emergency flush path, so
/// it must stay a single synchronous write.
pub fn persist_pending_segment(caches_dir: &Path, pending: &PendingSegment) -> Result<()> {
    let path = pending_metadata_path(caches_dir);
    let json = serde_json::to_vec(pending).context("failed to encode recovery metadata")?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to persist recovery metadata at {}", path.display()))?;
    Ok(())
}

/// Loads the pending record if one survived a crash. Corrupt metadata is
/// treated as absent; the orphan sweep will reclaim the file itself.
pub fn pending_crash_segment_metadata(caches_dir: &Path) -> Option<PendingSegment> {
    let path = pending_metadata_path(caches_dir);
    let bytes = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(pending) => Some(pending),
        Err(err) => {
            log::warn!("discarding corrupt recovery metadata at {}: {err}", path.display());
            None
        }
    }
}

pub fn clear_pending_crash_segment_metadata(caches_dir: &Path) {
    let _ = std::fs::remove_file(pending_metadata_path(caches_dir));
}
