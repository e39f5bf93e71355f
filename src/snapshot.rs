//! File-based aggregate snapshots.
//!
//! Snapshots are a cache: the event stream stays authoritative. They are
//! stored as JSON at
//! `<dir>/snapshots/<aggregate_type>/<instance_id>/snapshot.json` and written
//! with a temp-rename so readers never see a partial file.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::Aggregate;

/// A point-in-time snapshot of an aggregate's state and stream version.
///
/// `stream_version` is the version of the last event folded into `state`,
/// so loading resumes reading at `stream_version + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The aggregate state at the time of the snapshot.
    pub state: A,
    /// The stream version at snapshot time.
    pub stream_version: u64,
}

/// When and where the dispatcher writes snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Root directory for snapshot files.
    pub dir: PathBuf,
    /// Write a snapshot each time the stream crosses a multiple of this
    /// many events. Values below 1 are treated as 1.
    pub every: u64,
}

impl SnapshotPolicy {
    /// Whether an append moving the stream from `old_version` to
    /// `new_version` should be followed by a snapshot.
    pub(crate) fn is_due(&self, old_version: u64, new_version: u64) -> bool {
        let every = self.every.max(1);
        new_version / every > old_version / every
    }
}

/// Compute the filesystem path for a snapshot file.
///
/// # Returns
///
/// `<base_dir>/snapshots/<aggregate_type>/<instance_id>/snapshot.json`
pub fn snapshot_path(base_dir: &Path, aggregate_type: &str, instance_id: &str) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(aggregate_type)
        .join(instance_id)
        .join("snapshot.json")
}

/// Save an aggregate snapshot atomically to disk.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, file writing, or renaming fails.
pub fn save_snapshot<A: Aggregate>(
    base_dir: &Path,
    instance_id: &str,
    snapshot: &Snapshot<A>,
) -> io::Result<()> {
    let path = snapshot_path(base_dir, A::AGGREGATE_TYPE, instance_id);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load an aggregate snapshot from disk.
///
/// # Returns
///
/// - `Ok(Some(snapshot))` if the file exists and deserializes successfully.
/// - `Ok(None)` if the file does not exist or contains invalid JSON.
///   Deserialization failures are logged as warnings.
///
/// # Errors
///
/// Returns `io::Error` only for unexpected I/O failures (e.g. permission denied).
pub fn load_snapshot<A: Aggregate>(
    base_dir: &Path,
    instance_id: &str,
) -> io::Result<Option<Snapshot<A>>> {
    let path = snapshot_path(base_dir, A::AGGREGATE_TYPE, instance_id);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_slice::<Snapshot<A>>(&bytes) {
        Ok(snap) => Ok(Some(snap)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize snapshot; treating as cache miss"
            );
            Ok(None)
        }
    }
}
