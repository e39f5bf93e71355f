//! Durable process manager state: per-instance records and subscription cursors.
//!
//! An [`InstanceRecord`] is updated with compare-and-swap on its `revision`,
//! so two writers that loaded the same revision cannot both succeed. The
//! subscription cursor is the global position of the last event the process
//! manager acknowledged.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CheckpointError;

/// Lifecycle of a process manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Reacting to events.
    Active,
    /// Terminal: further events are acknowledged without being applied.
    Completed,
}

/// Progress through one event's reaction commands, kept when dispatching
/// stopped part way so a redelivery skips the commands already sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReaction {
    /// The event being reacted to.
    pub event_id: Uuid,
    /// How many of its commands were already dispatched or dead-lettered.
    pub completed: usize,
}

/// Persisted state of one process manager instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// The process manager's state, serialized.
    pub state: Value,
    /// Active or completed.
    pub status: InstanceStatus,
    /// IDs of the most recent events applied to this instance, oldest
    /// first, at most [`MAX_TRACKED_IDS`]. Older events are recognised by
    /// `high_water_mark` instead.
    pub applied_events: VecDeque<Uuid>,
    /// IDs of the most recent commands this instance dispatched, oldest
    /// first, at most [`MAX_TRACKED_IDS`].
    pub emitted_commands: VecDeque<Uuid>,
    /// Global position of the last applied event.
    pub high_water_mark: u64,
    /// Set while an event's commands are partially dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingReaction>,
    /// Compare-and-swap revision; 0 means never saved.
    pub revision: u64,
}

impl InstanceRecord {
    /// A record for an instance that has not seen any event yet.
    pub fn new(state: Value) -> Self {
        Self {
            state,
            status: InstanceStatus::Active,
            applied_events: VecDeque::new(),
            emitted_commands: VecDeque::new(),
            high_water_mark: 0,
            pending: None,
            revision: 0,
        }
    }

    /// Whether `event_id` is among the recently applied events.
    pub fn has_applied(&self, event_id: &Uuid) -> bool {
        self.applied_events.contains(event_id)
    }

    /// Whether the event at `global_position` was already applied.
    ///
    /// An instance applies its events in global order, so anything at or
    /// below the high-water mark is behind it even once its ID has been
    /// dropped from `applied_events`.
    pub fn is_duplicate(&self, event_id: &Uuid, global_position: u64) -> bool {
        global_position <= self.high_water_mark || self.has_applied(event_id)
    }

    /// Mark an event applied and advance the high-water mark.
    pub fn record_applied(&mut self, event_id: Uuid, global_position: u64) {
        push_bounded(&mut self.applied_events, event_id);
        self.high_water_mark = self.high_water_mark.max(global_position);
    }

    /// Remember a dispatched command.
    pub fn record_emitted(&mut self, command_id: Uuid) {
        push_bounded(&mut self.emitted_commands, command_id);
    }
}

/// How many event and command IDs an [`InstanceRecord`] keeps.
///
/// Bounds the record of a long-lived instance, which is rewritten in full
/// on every save.
pub const MAX_TRACKED_IDS: usize = 256;

fn push_bounded(ids: &mut VecDeque<Uuid>, id: Uuid) {
    ids.push_back(id);
    while ids.len() > MAX_TRACKED_IDS {
        ids.pop_front();
    }
}

/// Storage for process manager instance records and subscription cursors.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the record for `key`, `None` if the instance was never saved.
    async fn load_instance(
        &self,
        process_manager: &str,
        key: &str,
    ) -> Result<Option<InstanceRecord>, CheckpointError>;

    /// Save `record` if the stored revision equals `record.revision`.
    ///
    /// # Returns
    ///
    /// The new revision (`record.revision + 1`).
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Conflict`] if another writer saved first.
    async fn save_instance(
        &self,
        process_manager: &str,
        key: &str,
        record: &InstanceRecord,
    ) -> Result<u64, CheckpointError>;

    /// Last acknowledged global position, 0 if none.
    async fn load_cursor(&self, process_manager: &str) -> Result<u64, CheckpointError>;

    /// Persist the last acknowledged global position.
    async fn save_cursor(&self, process_manager: &str, position: u64) -> Result<(), CheckpointError>;
}

// --- In-memory store ---

/// A [`CheckpointStore`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    instances: Mutex<HashMap<(String, String), InstanceRecord>>,
    cursors: Mutex<HashMap<String, u64>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load_instance(
        &self,
        process_manager: &str,
        key: &str,
    ) -> Result<Option<InstanceRecord>, CheckpointError> {
        let instances = self.instances.lock().await;
        Ok(instances
            .get(&(process_manager.to_string(), key.to_string()))
            .cloned())
    }

    async fn save_instance(
        &self,
        process_manager: &str,
        key: &str,
        record: &InstanceRecord,
    ) -> Result<u64, CheckpointError> {
        let mut instances = self.instances.lock().await;
        let slot = (process_manager.to_string(), key.to_string());
        let actual = instances.get(&slot).map_or(0, |r| r.revision);
        if actual != record.revision {
            return Err(CheckpointError::Conflict {
                process_manager: process_manager.to_string(),
                key: key.to_string(),
                expected: record.revision,
                actual,
            });
        }
        let mut stored = record.clone();
        stored.revision = actual + 1;
        instances.insert(slot, stored);
        Ok(actual + 1)
    }

    async fn load_cursor(&self, process_manager: &str) -> Result<u64, CheckpointError> {
        Ok(self
            .cursors
            .lock()
            .await
            .get(process_manager)
            .copied()
            .unwrap_or(0))
    }

    async fn save_cursor(&self, process_manager: &str, position: u64) -> Result<(), CheckpointError> {
        self.cursors
            .lock()
            .await
            .insert(process_manager.to_string(), position);
        Ok(())
    }
}

// --- File store ---

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    position: u64,
}

/// A [`CheckpointStore`] keeping one JSON file per record.
///
/// Layout under the root directory:
///
/// ```text
/// process_managers/<name>/cursor.json
/// process_managers/<name>/instances/<encoded key>.json
/// ```
///
/// Every write goes to a temp file that is then renamed over the target, so
/// a crash never leaves a torn record. Compare-and-swap is enforced within
/// one process; the directory must not be shared between processes.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    // Serializes read-compare-write of instance records.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Use `root` as the checkpoint directory. Created lazily on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn pm_dir(&self, process_manager: &str) -> PathBuf {
        self.root
            .join("process_managers")
            .join(encode_key(process_manager))
    }

    fn instance_path(&self, process_manager: &str, key: &str) -> PathBuf {
        self.pm_dir(process_manager)
            .join("instances")
            .join(format!("{}.json", encode_key(key)))
    }

    fn cursor_path(&self, process_manager: &str) -> PathBuf {
        self.pm_dir(process_manager).join("cursor.json")
    }
}

/// Encode an arbitrary key as a portable file name.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Write `value` as JSON to `path` via a temp file and rename.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load_instance(
        &self,
        process_manager: &str,
        key: &str,
    ) -> Result<Option<InstanceRecord>, CheckpointError> {
        let path = self.instance_path(process_manager, key);
        // A corrupt record is an error, not a miss: treating it as new would
        // forget which events were applied and re-emit their commands.
        match read_optional(&path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_instance(
        &self,
        process_manager: &str,
        key: &str,
        record: &InstanceRecord,
    ) -> Result<u64, CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let path = self.instance_path(process_manager, key);
        let actual = match read_optional(&path)? {
            Some(bytes) => serde_json::from_slice::<InstanceRecord>(&bytes)?.revision,
            None => 0,
        };
        if actual != record.revision {
            return Err(CheckpointError::Conflict {
                process_manager: process_manager.to_string(),
                key: key.to_string(),
                expected: record.revision,
                actual,
            });
        }
        let mut stored = record.clone();
        stored.revision = actual + 1;
        write_atomic(&path, &stored)?;
        Ok(stored.revision)
    }

    async fn load_cursor(&self, process_manager: &str) -> Result<u64, CheckpointError> {
        let path = self.cursor_path(process_manager);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(0);
        };
        match serde_json::from_slice::<CursorFile>(&bytes) {
            Ok(cursor) => Ok(cursor.position),
            Err(e) => {
                // Replaying from the start is safe: instance records dedup.
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt process manager cursor, replaying from the start"
                );
                Ok(0)
            }
        }
    }

    async fn save_cursor(&self, process_manager: &str, position: u64) -> Result<(), CheckpointError> {
        write_atomic(&self.cursor_path(process_manager), &CursorFile { position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InstanceRecord {
        let mut record = InstanceRecord::new(serde_json::json!({"stage": "started"}));
        record.record_applied(Uuid::new_v4(), 1);
        record.high_water_mark = 4;
        record
    }

    async fn exercise_cas(store: &dyn CheckpointStore) {
        assert!(store.load_instance("transfer", "t-1").await.unwrap().is_none());

        let first = record();
        let rev = store.save_instance("transfer", "t-1", &first).await.unwrap();
        assert_eq!(rev, 1);

        let loaded = store
            .load_instance("transfer", "t-1")
            .await
            .unwrap()
            .expect("record saved");
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.applied_events, first.applied_events);

        // A second writer still holding revision 0 loses.
        let err = store
            .save_instance("transfer", "t-1", &first)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Conflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        let mut next = loaded.clone();
        next.status = InstanceStatus::Completed;
        assert_eq!(store.save_instance("transfer", "t-1", &next).await.unwrap(), 2);
    }

    async fn exercise_cursor(store: &dyn CheckpointStore) {
        assert_eq!(store.load_cursor("transfer").await.unwrap(), 0);
        store.save_cursor("transfer", 17).await.unwrap();
        assert_eq!(store.load_cursor("transfer").await.unwrap(), 17);
        assert_eq!(store.load_cursor("bonus").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn in_memory_compare_and_swap() {
        exercise_cas(&InMemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn in_memory_cursor() {
        exercise_cursor(&InMemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn file_compare_and_swap() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        exercise_cas(&FileCheckpointStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn file_cursor() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        exercise_cursor(&FileCheckpointStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let saved = record();
        {
            let store = FileCheckpointStore::new(dir.path());
            store.save_instance("transfer", "t/1", &saved).await.unwrap();
            store.save_cursor("transfer", 9).await.unwrap();
        }

        let reopened = FileCheckpointStore::new(dir.path());
        let loaded = reopened
            .load_instance("transfer", "t/1")
            .await
            .unwrap()
            .expect("record survives reopen");
        assert_eq!(loaded.state, saved.state);
        assert_eq!(reopened.load_cursor("transfer").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn corrupt_cursor_replays_from_start() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileCheckpointStore::new(dir.path());
        let path = store.cursor_path("transfer");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        assert_eq!(store.load_cursor("transfer").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_instance_record_is_an_error() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileCheckpointStore::new(dir.path());
        let path = store.instance_path("transfer", "t-1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        let err = store.load_instance("transfer", "t-1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Serialization(_)));
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileCheckpointStore::new(dir.path());
        store.save_instance("transfer", "t-1", &record()).await.unwrap();

        let path = store.instance_path("transfer", "t-1");
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn tracked_ids_are_bounded_and_old_events_still_deduplicate() {
        let mut record = InstanceRecord::new(serde_json::json!({}));
        let first = Uuid::new_v4();
        record.record_applied(first, 1);
        let last = MAX_TRACKED_IDS as u64 + 10;
        for position in 2..=last {
            record.record_applied(Uuid::new_v4(), position);
            record.record_emitted(Uuid::new_v4());
        }

        assert_eq!(record.applied_events.len(), MAX_TRACKED_IDS);
        assert_eq!(record.emitted_commands.len(), MAX_TRACKED_IDS);
        assert_eq!(record.high_water_mark, last);
        assert!(!record.has_applied(&first));
        assert!(record.is_duplicate(&first, 1));
        assert!(!record.is_duplicate(&Uuid::new_v4(), last + 1));
    }

    #[test]
    fn encode_key_escapes_separators() {
        assert_eq!(encode_key("t-1_a"), "t-1_a");
        assert_eq!(encode_key("a/b"), "a%2Fb");
        assert_eq!(encode_key(".."), "%2E%2E");
    }
}
