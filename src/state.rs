use std::fs;
use std::path::PathBuf;

use dashmap::DashSet;
use tracing::{debug, error, info, warn};

use crate::config::MAX_DEDUP_EVENTS;

/// Fraction of the maximum pruned when the store is full.
const PRUNE_RATIO: f64 = 0.2;

/// Tracks processed event keys so replayed audit records do not produce
/// duplicate notifications. State survives restarts through a JSON file
/// written atomically on close.
///
/// All operations take `&self` and are safe to call from concurrent
/// processing tasks.
pub struct DeduplicationStore {
    processed: DashSet<String>,
    state_path: PathBuf,
}

impl DeduplicationStore {
    /// Opens the store, loading any previously persisted keys. A missing or
    /// unreadable state file starts the store empty rather than failing.
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        let store = Self {
            processed: DashSet::new(),
            state_path: state_path.into(),
        };
        store.load_state();
        store
    }

    pub fn is_duplicate(&self, key: &str) -> bool {
        self.processed.contains(key)
    }

    /// Records a key as processed. Returns true if the key was newly added.
    pub fn mark_processed(&self, key: &str) -> bool {
        if self.processed.len() >= MAX_DEDUP_EVENTS {
            self.prune_old_entries();
        }
        self.processed.insert(key.to_string())
    }

    /// Drops 20% of the maximum capacity in iteration order so inserts can
    /// continue without unbounded growth.
    fn prune_old_entries(&self) {
        let to_remove = (MAX_DEDUP_EVENTS as f64 * PRUNE_RATIO) as usize;
        let victims: Vec<String> = self
            .processed
            .iter()
            .take(to_remove)
            .map(|key| key.clone())
            .collect();
        for victim in &victims {
            self.processed.remove(victim);
        }
        debug!("Pruned {} entries from deduplication store", victims.len());
    }

    fn load_state(&self) {
        if !self.state_path.exists() {
            debug!(
                "No existing state file found at {}",
                self.state_path.display()
            );
            return;
        }

        let text = match fs::read_to_string(&self.state_path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read dedup state file, starting fresh: {e}");
                return;
            }
        };

        match serde_json::from_str::<Vec<String>>(&text) {
            Ok(keys) => {
                let count = keys.len();
                for key in keys {
                    self.processed.insert(key);
                }
                info!("Loaded {count} entries from deduplication state file");
            }
            Err(e) => {
                warn!("Failed to parse dedup state file, starting fresh: {e}");
            }
        }
    }

    /// Persists the current key set, writing to a temporary file and
    /// renaming over the target so a crash mid-write cannot corrupt it.
    pub fn save_state(&self) {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent) {
                    error!("Failed to create state directory: {e}");
                    return;
                }
            }
        }

        let keys: Vec<String> = self.processed.iter().map(|key| key.clone()).collect();
        let json = match serde_json::to_string(&keys) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize dedup state: {e}");
                return;
            }
        };

        let mut tmp_os = self.state_path.clone().into_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);
        if let Err(e) = fs::write(&tmp_path, json) {
            error!("Failed to write dedup state file: {e}");
            return;
        }
        if let Err(e) = fs::rename(&tmp_path, &self.state_path) {
            error!("Failed to replace dedup state file: {e}");
            return;
        }
        debug!("Saved {} entries to deduplication state file", keys.len());
    }

    pub fn size(&self) -> usize {
        self.processed.len()
    }

    /// Drops all tracked keys. The state file is untouched until the next
    /// save.
    pub fn clear(&self) {
        self.processed.clear();
        info!("Deduplication store cleared");
    }

    /// Flushes to disk.
    pub fn close(&self) {
        self.save_state();
        info!(
            "Deduplication store closed, saved {} entries",
            self.processed.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> DeduplicationStore {
        DeduplicationStore::new(dir.path().join("state.json"))
    }

    #[test]
    fn marks_and_detects_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(!store.is_duplicate("orders-value:schema-registry.RegisterSchema:100001"));
        assert!(store.mark_processed("orders-value:schema-registry.RegisterSchema:100001"));
        assert!(store.is_duplicate("orders-value:schema-registry.RegisterSchema:100001"));
        assert!(!store.mark_processed("orders-value:schema-registry.RegisterSchema:100001"));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn clear_empties_the_store() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.mark_processed("a");
        store.mark_processed("b");
        store.clear();
        assert_eq!(store.size(), 0);
        assert!(!store.is_duplicate("a"));
    }

    #[test]
    fn state_survives_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = DeduplicationStore::new(&path);
        store.mark_processed("k1");
        store.mark_processed("k2");
        store.close();

        let reopened = DeduplicationStore::new(&path);
        assert_eq!(reopened.size(), 2);
        assert!(reopened.is_duplicate("k1"));
        assert!(reopened.is_duplicate("k2"));
        assert!(!reopened.is_duplicate("k3"));
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/state.json");

        let store = DeduplicationStore::new(&path);
        store.mark_processed("k1");
        store.close();

        assert!(path.exists());
        let reopened = DeduplicationStore::new(&path);
        assert!(reopened.is_duplicate("k1"));
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let store = DeduplicationStore::new(&path);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn prunes_when_full() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for i in 0..MAX_DEDUP_EVENTS {
            store.mark_processed(&format!("key-{i}"));
        }
        assert_eq!(store.size(), MAX_DEDUP_EVENTS);

        assert!(store.mark_processed("one-more"));
        let expected = MAX_DEDUP_EVENTS - (MAX_DEDUP_EVENTS as f64 * PRUNE_RATIO) as usize + 1;
        assert_eq!(store.size(), expected);
        assert!(store.is_duplicate("one-more"));
    }

    #[test]
    fn size_never_exceeds_maximum() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for i in 0..(MAX_DEDUP_EVENTS + 5_000) {
            store.mark_processed(&format!("key-{i}"));
            assert!(store.size() <= MAX_DEDUP_EVENTS);
        }
    }
}
