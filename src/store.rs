//! Durable snapshot of the N-stream result set, readable by any process
//! that opens the same database file.
//!
//! One well-known key, overwrite semantics. Loads fail soft: a missing or
//! unparseable snapshot comes back as the empty set, never an error, so a
//! corrupt row can't take down a run. Saves have two paths — a deferred one
//! that hops off the async runtime, and a forced synchronous one for
//! moments when another context is about to read.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GenerationError;

/// Well-known snapshot key shared by every context.
pub const SNAPSHOT_KEY: &str = "stream-results";

/// One stream's externally-visible state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredStream {
    pub id: String,
    pub content: String,
    #[serde(rename = "isLoading")]
    pub is_loading: bool,
}

/// The persisted result set: an ordered array, one element per index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct PersistedResultSet {
    pub streams: Vec<StoredStream>,
}

impl PersistedResultSet {
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Merge two eventually-consistent views of the same run, preferring the
    /// longer content per index. Store reads and broadcast messages carry no
    /// ordering guarantee relative to each other; content length is the
    /// recency signal because content only grows within a run.
    pub fn reconcile(mut self, other: &PersistedResultSet) -> PersistedResultSet {
        for (mine, theirs) in self.streams.iter_mut().zip(&other.streams) {
            if theirs.content.len() > mine.content.len() {
                mine.content = theirs.content.clone();
                mine.is_loading = theirs.is_loading;
            }
        }
        self
    }
}

pub struct ResultStore {
    conn: Mutex<Connection>,
    // Saves are ordered by claim time, not completion time: a deferred save
    // still on the blocking pool must not overwrite a newer forced save.
    next_seq: AtomicU64,
    last_written: AtomicU64,
}

impl ResultStore {
    /// Open (or create) the snapshot database at `path`.
    pub fn open(path: &Path) -> Result<Self, GenerationError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                key     TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        Ok(ResultStore {
            conn: Mutex::new(conn),
            next_seq: AtomicU64::new(0),
            last_written: AtomicU64::new(0),
        })
    }

    fn claim_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Persist a full snapshot, overwriting the previous one.
    pub fn save(&self, set: &PersistedResultSet) -> Result<(), GenerationError> {
        let seq = self.claim_seq();
        self.save_seq(seq, set)
    }

    fn save_seq(&self, seq: u64, set: &PersistedResultSet) -> Result<(), GenerationError> {
        let payload = serde_json::to_string(set)?;
        let conn = self.conn.lock().expect("store lock poisoned");
        if seq <= self.last_written.load(Ordering::Acquire) {
            return Ok(());
        }
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (key, payload) VALUES (?1, ?2)",
            rusqlite::params![SNAPSHOT_KEY, payload],
        )?;
        self.last_written.store(seq, Ordering::Release);
        Ok(())
    }

    /// Persist off the async runtime. Failures are logged, not surfaced —
    /// a later flush or the terminal forced save carries the same data.
    pub fn save_deferred(self: &Arc<Self>, set: PersistedResultSet) {
        let seq = self.claim_seq();
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = store.save_seq(seq, &set) {
                warn!(error = %err, "deferred snapshot save failed");
            }
        });
    }

    /// Load the last saved snapshot. Missing or corrupt payloads come back
    /// as the empty set.
    pub fn load(&self) -> PersistedResultSet {
        let conn = self.conn.lock().expect("store lock poisoned");
        let payload: Option<String> = match conn
            .query_row(
                "SELECT payload FROM snapshots WHERE key = ?1",
                rusqlite::params![SNAPSHOT_KEY],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "snapshot read failed, treating as empty");
                return PersistedResultSet::default();
            }
        };

        match payload {
            Some(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(error = %err, "corrupt snapshot payload, treating as empty");
                PersistedResultSet::default()
            }),
            None => PersistedResultSet::default(),
        }
    }

    /// Remove the snapshot entirely.
    pub fn clear(&self) -> Result<(), GenerationError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM snapshots WHERE key = ?1",
            rusqlite::params![SNAPSHOT_KEY],
        )?;
        Ok(())
    }

    /// A snapshot written for a different stream count is stale for the run
    /// being started; drop it rather than let another context read shapes
    /// that no longer match.
    pub fn discard_if_stale(&self, stream_count: usize) -> Result<(), GenerationError> {
        let existing = self.load();
        if !existing.is_empty() && existing.stream_count() != stream_count {
            self.clear()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stream(id: &str, content: &str, loading: bool) -> StoredStream {
        StoredStream {
            id: id.to_string(),
            content: content.to_string(),
            is_loading: loading,
        }
    }

    fn set(streams: Vec<StoredStream>) -> PersistedResultSet {
        PersistedResultSet { streams }
    }

    fn open_temp() -> (TempDir, ResultStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("snap.db")).expect("open");
        (dir, store)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = open_temp();
        let snapshot = set(vec![stream("a", "once upon", true), stream("b", "", true)]);
        store.save(&snapshot).expect("save");
        assert_eq!(store.load(), snapshot);
    }

    #[test]
    fn test_load_empty_when_nothing_saved() {
        let (_dir, store) = open_temp();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_overwrites_previous() {
        let (_dir, store) = open_temp();
        store.save(&set(vec![stream("a", "v1", true)])).expect("save");
        store.save(&set(vec![stream("a", "v1v2", false)])).expect("save");
        let loaded = store.load();
        assert_eq!(loaded.streams[0].content, "v1v2");
        assert!(!loaded.streams[0].is_loading);
    }

    #[test]
    fn test_save_twice_identical_is_idempotent() {
        let (_dir, store) = open_temp();
        let snapshot = set(vec![stream("a", "same", false)]);
        store.save(&snapshot).expect("save");
        store.save(&snapshot).expect("save again");
        assert_eq!(store.load(), snapshot);
    }

    #[test]
    fn test_corrupt_payload_loads_as_empty() {
        let (_dir, store) = open_temp();
        {
            let conn = store.conn.lock().expect("lock");
            conn.execute(
                "INSERT OR REPLACE INTO snapshots (key, payload) VALUES (?1, ?2)",
                rusqlite::params![SNAPSHOT_KEY, "{definitely not json"],
            )
            .expect("inject");
        }
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_two_handles_one_path_cross_context_read() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("snap.db");
        let writer = ResultStore::open(&path).expect("open writer");
        let reader = ResultStore::open(&path).expect("open reader");

        writer
            .save(&set(vec![stream("a", "visible elsewhere", true)]))
            .expect("save");
        assert_eq!(reader.load().streams[0].content, "visible elsewhere");
    }

    #[test]
    fn test_discard_if_stale_drops_mismatched_count() {
        let (_dir, store) = open_temp();
        store
            .save(&set(vec![stream("a", "x", false), stream("b", "y", false)]))
            .expect("save");
        store.discard_if_stale(3).expect("discard");
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_discard_if_stale_keeps_matching_count() {
        let (_dir, store) = open_temp();
        let snapshot = set(vec![stream("a", "x", false), stream("b", "y", false)]);
        store.save(&snapshot).expect("save");
        store.discard_if_stale(2).expect("discard");
        assert_eq!(store.load(), snapshot);
    }

    #[test]
    fn test_stale_claimed_save_is_skipped() {
        let (_dir, store) = open_temp();
        // A writer that claimed its slot early but runs late must not
        // overwrite data claimed after it.
        let stale_seq = store.claim_seq();
        store
            .save(&set(vec![stream("a", "newer", false)]))
            .expect("save");
        store
            .save_seq(stale_seq, &set(vec![stream("a", "older", true)]))
            .expect("stale save");
        assert_eq!(store.load().streams[0].content, "newer");
    }

    #[tokio::test]
    async fn test_save_deferred_lands() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(ResultStore::open(&dir.path().join("snap.db")).expect("open"));
        store.save_deferred(set(vec![stream("a", "deferred", true)]));

        // spawn_blocking work has no completion handle here; poll briefly.
        for _ in 0..50 {
            if !store.load().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.load().streams[0].content, "deferred");
    }

    #[test]
    fn test_serialized_shape_is_bare_array_with_is_loading() {
        let snapshot = set(vec![stream("id-0", "hello", true)]);
        let json = serde_json::to_string(&snapshot).expect("serialize");
        assert!(json.starts_with('['));
        assert!(json.contains("\"isLoading\":true"));
        assert!(!json.contains("is_loading"));
    }

    #[test]
    fn test_reconcile_prefers_longer_content() {
        let store_view = set(vec![stream("a", "abc", true), stream("b", "12345", false)]);
        let channel_view = set(vec![stream("a", "abcdef", false), stream("b", "12", true)]);
        let merged = store_view.reconcile(&channel_view);
        assert_eq!(merged.streams[0].content, "abcdef");
        assert!(!merged.streams[0].is_loading);
        assert_eq!(merged.streams[1].content, "12345");
    }
}
