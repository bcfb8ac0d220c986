//! Per-user memory persistence.
//!
//! Each user's profile lives at `<data_dir>/<user_id>.json`. Saves go
//! through a uniquely-named sibling temp file followed by an atomic rename,
//! so a crash mid-save leaves either the previous content or none — never a
//! partial file. Syncing is throttled: the store tracks the snapshot taken
//! at the last load/sync and only reports changes against it.

use crate::error::{Result, WallaceError};
use crate::session::UserMemory;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

struct StoreState {
    last_sync: Option<Instant>,
    last_snapshot: UserMemory,
}

/// Persistence handle for one user's memory file.
pub struct MemoryStore {
    user_id: String,
    data_dir: PathBuf,
    sync_interval: Duration,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Create a store for `user_id` rooted at `data_dir`.
    pub fn new(user_id: impl Into<String>, data_dir: impl Into<PathBuf>, sync_interval: Duration) -> Self {
        Self {
            user_id: user_id.into(),
            data_dir: data_dir.into(),
            sync_interval,
            state: Mutex::new(StoreState {
                last_sync: None,
                last_snapshot: UserMemory::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Path of the user's memory file.
    pub fn file_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.json", self.user_id))
    }

    /// Load the profile from disk.
    ///
    /// A missing or unparseable file yields a default profile (with a
    /// warning for the latter). Unknown fields in the file are ignored.
    pub fn load(&self) -> UserMemory {
        let path = self.file_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return UserMemory::default(),
        };
        let memory = match serde_json::from_str::<UserMemory>(&raw) {
            Ok(memory) => memory,
            Err(e) => {
                warn!(user_id = %self.user_id, "failed to load memory: {e}, using defaults");
                return UserMemory::default();
            }
        };
        self.lock().last_snapshot = memory.clone();
        memory
    }

    /// Save the profile with write-temp-then-rename.
    ///
    /// # Errors
    ///
    /// Returns [`WallaceError::Persistence`] on any filesystem failure; the
    /// temp file is removed before the error propagates.
    pub fn save(&self, memory: &UserMemory) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| WallaceError::Persistence(format!("create {}: {e}", self.data_dir.display())))?;

        let json = serde_json::to_string_pretty(memory)
            .map_err(|e| WallaceError::Persistence(format!("serialize memory: {e}")))?;

        // Unique sibling so concurrent saves never share a temp file; each
        // rename is atomic and the last writer wins.
        let tmp = self
            .data_dir
            .join(format!("{}.{}.tmp", self.user_id, uuid::Uuid::new_v4()));

        if let Err(e) = write_and_rename(&tmp, &self.file_path(), &json) {
            let _ = std::fs::remove_file(&tmp);
            return Err(WallaceError::Persistence(format!(
                "save memory for {}: {e}",
                self.user_id
            )));
        }
        Ok(())
    }

    /// Whether `memory` differs from the snapshot taken at the last
    /// load/sync.
    pub fn has_changes(&self, memory: &UserMemory) -> bool {
        *memory != self.lock().last_snapshot
    }

    /// Whether the sync interval has elapsed since the last `mark_synced`.
    pub fn should_sync(&self) -> bool {
        match self.lock().last_sync {
            Some(at) => at.elapsed() >= self.sync_interval,
            None => true,
        }
    }

    /// Record a successful sync of `memory`.
    pub fn mark_synced(&self, memory: &UserMemory) {
        let mut state = self.lock();
        state.last_sync = Some(Instant::now());
        state.last_snapshot = memory.clone();
    }

    /// Run [`MemoryStore::save`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// Propagates the underlying save error.
    pub async fn save_async(self: &Arc<Self>, memory: UserMemory) -> Result<()> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.save(&memory))
            .await
            .map_err(|e| WallaceError::Persistence(format!("save task failed: {e}")))?
    }

    /// Run [`MemoryStore::load`] on the blocking pool.
    pub async fn load_async(self: &Arc<Self>) -> UserMemory {
        let store = Arc::clone(self);
        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(memory) => memory,
            Err(e) => {
                warn!("memory load task failed: {e}");
                UserMemory::default()
            }
        }
    }
}

fn write_and_rename(tmp: &Path, dest: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(tmp, contents)?;
    std::fs::rename(tmp, dest)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn store_in(dir: &Path) -> MemoryStore {
        MemoryStore::new("test_user", dir, Duration::from_secs(300))
    }

    fn sample_memory() -> UserMemory {
        UserMemory {
            nickname: "小明".to_owned(),
            interests: vec!["coding".to_owned(), "music".to_owned()],
            interaction_count: 7,
            ..UserMemory::default()
        }
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mem = store.load();
        assert!(mem.nickname.is_empty());
        assert!(mem.interests.is_empty());
    }

    #[test]
    fn load_corrupt_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test_user.json"), "not json{{{").unwrap();
        let store = store_in(dir.path());
        assert!(store.load().nickname.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mem = sample_memory();
        store.save(&mem).unwrap();
        assert_eq!(store.load(), mem);
    }

    #[test]
    fn save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("memory");
        let store = store_in(&nested);
        store.save(&sample_memory()).unwrap();
        assert!(nested.join("test_user.json").exists());
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.save(&sample_memory()).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn sequential_saves_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .save(&UserMemory {
                nickname: "first".to_owned(),
                ..UserMemory::default()
            })
            .unwrap();
        store
            .save(&UserMemory {
                nickname: "second".to_owned(),
                ..UserMemory::default()
            })
            .unwrap();
        assert_eq!(store.load().nickname, "second");
    }

    #[test]
    fn concurrent_saves_never_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));

        let mut handles = Vec::new();
        for worker in 0..5 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    let mem = UserMemory {
                        nickname: format!("worker_{worker}_iter_{i}"),
                        interaction_count: worker * 1000 + i,
                        ..UserMemory::default()
                    };
                    store.save(&mem).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // The file parses and equals one of the inputs.
        let loaded = store.load();
        assert!(loaded.nickname.starts_with("worker_"));
    }

    #[test]
    fn has_changes_tracks_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.save(&sample_memory()).unwrap();

        let mut mem = store.load();
        assert!(!store.has_changes(&mem));
        mem.nickname = "changed".to_owned();
        assert!(store.has_changes(&mem));
    }

    #[test]
    fn sync_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.should_sync());
        store.mark_synced(&UserMemory::default());
        assert!(!store.should_sync());

        let zero = MemoryStore::new("t", dir.path(), Duration::ZERO);
        zero.mark_synced(&UserMemory::default());
        assert!(zero.should_sync());
    }

    #[test]
    fn simulated_crash_between_write_and_rename_preserves_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.save(&sample_memory()).unwrap();

        // A crash after the temp write but before rename leaves a stray temp
        // file; the destination must still hold the previous content.
        std::fs::write(dir.path().join("test_user.deadbeef.tmp"), "{ partial").unwrap();
        assert_eq!(store.load(), sample_memory());
    }
}
