use std::collections::{BTreeMap, BTreeSet};
use std::fs::{read_to_string, write};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::gelbooru::io::Config;
use crate::gelbooru::sender::entries::{TAG_KIND_CHARACTER, TAG_KIND_COPYRIGHT, TagEntry};

/// Which half of the pipeline gave up on a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FailureKind {
    #[serde(rename = "api-error")]
    Api,
    #[serde(rename = "download-error")]
    Download,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Api => write!(f, "api-error"),
            FailureKind::Download => write!(f, "download-error"),
        }
    }
}

/// A post whose retry budget was exhausted. Never auto-cleared; removed only
/// by the retry command or a later fully successful fetch and download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FailureRecord {
    pub(crate) kind: FailureKind,
    pub(crate) message: String,
    pub(crate) recorded_at: DateTime<Utc>,
}

/// A resolved tag, persisted indefinitely since the tag taxonomy is assumed
/// stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TagRecord {
    pub(crate) kind: i64,
    pub(crate) name: String,
}

impl TagRecord {
    pub(crate) fn is_character(&self) -> bool {
        self.kind == TAG_KIND_CHARACTER
    }

    pub(crate) fn is_copyright(&self) -> bool {
        self.kind == TAG_KIND_COPYRIGHT
    }
}

impl From<TagEntry> for TagRecord {
    fn from(entry: TagEntry) -> Self {
        TagRecord {
            kind: entry.kind,
            name: entry.name,
        }
    }
}

/// Reads a serialized map, treating a missing or empty file as an empty map
/// and a corrupt one as empty with a warning. Malformed persisted state must
/// never take the pipeline down.
fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!("Could not read cache file {}: {e}", path.display());
            return T::default();
        }
    };

    if contents.trim().is_empty() {
        return T::default();
    }

    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "Cache file {} is corrupt and will be treated as empty: {e}",
                path.display()
            );
            T::default()
        }
    }
}

/// A buffered cache category: a durable map merged with a pending buffer.
/// One lock guards both maps and the file, so a flush is atomic from the
/// point of view of every other caller.
#[derive(Debug)]
struct BufferedCategory<T> {
    path: PathBuf,
    state: Mutex<BufferedState<T>>,
}

#[derive(Debug)]
struct BufferedState<T> {
    durable: BTreeMap<String, T>,
    pending: BTreeMap<String, T>,
}

impl<T: Serialize + DeserializeOwned + Clone> BufferedCategory<T> {
    fn load(path: PathBuf) -> Self {
        let durable = load_or_default(&path);
        BufferedCategory {
            path,
            state: Mutex::new(BufferedState {
                durable,
                pending: BTreeMap::new(),
            }),
        }
    }

    fn contains(&self, key: &str) -> bool {
        let state = self.state.lock();
        state.durable.contains_key(key) || state.pending.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<T> {
        let state = self.state.lock();
        state
            .durable
            .get(key)
            .or_else(|| state.pending.get(key))
            .cloned()
    }

    fn stage(&self, key: String, value: T) {
        self.state.lock().pending.insert(key, value);
    }

    fn len(&self) -> usize {
        let state = self.state.lock();
        state.durable.len() + state.pending.len()
    }

    /// Merges the pending buffer into the durable map and rewrites the whole
    /// backing file. No-op when nothing is pending.
    fn flush(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut state.pending);
        state.durable.extend(pending);
        let json = serde_json::to_string_pretty(&state.durable)?;
        write(&self.path, json)
            .with_context(|| format!("Failed to write cache file {}", self.path.display()))?;

        Ok(())
    }
}

/// A write-through cache category for the failure map: small, mutated rarely,
/// and worth persisting the moment it changes.
#[derive(Debug)]
struct FailureCategory {
    path: PathBuf,
    records: Mutex<BTreeMap<String, FailureRecord>>,
}

impl FailureCategory {
    fn load(path: PathBuf) -> Self {
        let records = load_or_default(&path);
        FailureCategory {
            path,
            records: Mutex::new(records),
        }
    }

    fn save_locked(&self, records: &BTreeMap<String, FailureRecord>) {
        let json = match serde_json::to_string_pretty(records) {
            Ok(json) => json,
            Err(e) => {
                error!("Could not serialize failure records: {e}");
                return;
            }
        };
        if let Err(e) = write(&self.path, json) {
            error!(
                "Could not persist failure records to {}: {e}",
                self.path.display()
            );
        }
    }
}

/// Write-through set of posts currently seeing rate-limit responses. Purely
/// advisory, used to warn the operator which posts are pending across runs.
#[derive(Debug)]
struct RateLimitedSet {
    path: PathBuf,
    ids: Mutex<BTreeSet<String>>,
}

impl RateLimitedSet {
    fn load(path: PathBuf) -> Self {
        let ids: Vec<String> = load_or_default(&path);
        RateLimitedSet {
            path,
            ids: Mutex::new(ids.into_iter().collect()),
        }
    }

    fn save_locked(&self, ids: &BTreeSet<String>) {
        let listed: Vec<&String> = ids.iter().collect();
        let json = match serde_json::to_string_pretty(&listed) {
            Ok(json) => json,
            Err(e) => {
                error!("Could not serialize rate-limited set: {e}");
                return;
            }
        };
        if let Err(e) = write(&self.path, json) {
            error!(
                "Could not persist rate-limited set to {}: {e}",
                self.path.display()
            );
        }
    }
}

/// Owns the four persistent cache categories and the buffered-write policy:
/// processed posts and tags are staged in memory and merged into the durable
/// files only at flush points, so a crash between flushes re-does at most one
/// page's worth of work.
#[derive(Debug)]
pub(crate) struct CacheStore {
    posts: BufferedCategory<bool>,
    tags: BufferedCategory<TagRecord>,
    failures: FailureCategory,
    rate_limited: RateLimitedSet,
}

impl CacheStore {
    /// Loads all four categories from files resolved against `root`.
    pub(crate) fn load(root: &Path, config: &Config) -> Self {
        CacheStore {
            posts: BufferedCategory::load(root.join(config.posts_cache_file())),
            tags: BufferedCategory::load(root.join(config.tag_cache_file())),
            failures: FailureCategory::load(root.join(config.failed_posts_cache_file())),
            rate_limited: RateLimitedSet::load(root.join(config.rate_limited_posts_file())),
        }
    }

    /// Whether a post already made it through a full fetch and download,
    /// durably or in the pending buffer. Checked before every fetch, this is
    /// the primary dedup mechanism.
    pub(crate) fn is_processed(&self, id: &str) -> bool {
        self.posts.contains(id)
    }

    /// Stages a post as processed. Only called once its file is confirmed on
    /// disk or a download just succeeded.
    pub(crate) fn mark_processed(&self, id: &str) {
        self.posts.stage(id.to_string(), true);
    }

    pub(crate) fn processed_count(&self) -> usize {
        self.posts.len()
    }

    pub(crate) fn has_tag(&self, name: &str) -> bool {
        self.tags.contains(name)
    }

    pub(crate) fn tag(&self, name: &str) -> Option<TagRecord> {
        self.tags.get(name)
    }

    /// Stages a freshly resolved tag record.
    pub(crate) fn stage_tag(&self, name: &str, record: TagRecord) {
        self.tags.stage(name.to_string(), record);
    }

    /// Records a post whose retry budget ran out. Written through immediately.
    pub(crate) fn record_failure(&self, id: &str, kind: FailureKind, message: String) {
        let mut records = self.failures.records.lock();
        records.insert(
            id.to_string(),
            FailureRecord {
                kind,
                message,
                recorded_at: Utc::now(),
            },
        );
        self.failures.save_locked(&records);
    }

    /// Drops a failure record, persisting only when something was removed.
    pub(crate) fn clear_failure(&self, id: &str) {
        let mut records = self.failures.records.lock();
        if records.remove(id).is_some() {
            self.failures.save_locked(&records);
        }
    }

    pub(crate) fn failures(&self) -> BTreeMap<String, FailureRecord> {
        self.failures.records.lock().clone()
    }

    pub(crate) fn add_rate_limited(&self, id: &str) {
        let mut ids = self.rate_limited.ids.lock();
        if ids.insert(id.to_string()) {
            self.rate_limited.save_locked(&ids);
        }
    }

    pub(crate) fn remove_rate_limited(&self, id: &str) {
        let mut ids = self.rate_limited.ids.lock();
        if ids.remove(id) {
            self.rate_limited.save_locked(&ids);
        }
    }

    pub(crate) fn rate_limited(&self) -> Vec<String> {
        self.rate_limited.ids.lock().iter().cloned().collect()
    }

    /// Merges both pending buffers into their durable files. Called at the
    /// end of every page, at the end of the run, and on interrupt.
    pub(crate) fn flush(&self) -> Result<(), Error> {
        self.posts.flush()?;
        self.tags.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gelbooru_cache_test_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn store_in(dir: &Path) -> CacheStore {
        CacheStore::load(dir, &Config::default())
    }

    #[test]
    fn missing_backing_files_load_as_empty() {
        let dir = scratch_dir();
        let store = store_in(&dir);

        assert!(!store.is_processed("123"));
        assert!(store.failures().is_empty());
        assert!(store.rate_limited().is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_failure_file_is_reported_not_fatal() {
        let dir = scratch_dir();
        let config = Config::default();
        fs::write(dir.join(config.failed_posts_cache_file()), "{not json!").unwrap();
        fs::write(dir.join(config.posts_cache_file()), "").unwrap();

        let store = store_in(&dir);
        assert!(store.failures().is_empty());
        assert!(!store.is_processed("1"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn pending_entries_are_visible_before_flush_and_durable_after() {
        let dir = scratch_dir();
        let config = Config::default();
        {
            let store = store_in(&dir);
            store.mark_processed("123");
            assert!(store.is_processed("123"));

            // Nothing on disk until the flush point.
            assert!(!dir.join(config.posts_cache_file()).exists());
            store.flush().unwrap();
        }

        let reloaded = store_in(&dir);
        assert!(reloaded.is_processed("123"));
        assert!(!reloaded.is_processed("456"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn flush_merges_pending_into_existing_durable_entries() {
        let dir = scratch_dir();
        {
            let store = store_in(&dir);
            store.mark_processed("1");
            store.flush().unwrap();
        }
        {
            let store = store_in(&dir);
            assert!(store.is_processed("1"));
            store.mark_processed("2");
            store.flush().unwrap();
        }

        let reloaded = store_in(&dir);
        assert!(reloaded.is_processed("1"));
        assert!(reloaded.is_processed("2"));
        assert_eq!(reloaded.processed_count(), 2);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn staged_tags_answer_lookups_before_flush() {
        let dir = scratch_dir();
        let store = store_in(&dir);

        assert!(!store.has_tag("some_character"));
        store.stage_tag(
            "some_character",
            TagRecord {
                kind: TAG_KIND_CHARACTER,
                name: String::from("some_character"),
            },
        );
        assert!(store.has_tag("some_character"));
        assert!(store.tag("some_character").unwrap().is_character());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn failure_records_round_trip_and_clear() {
        let dir = scratch_dir();
        {
            let store = store_in(&dir);
            store.record_failure("77", FailureKind::Api, String::from("gave up"));
        }

        let store = store_in(&dir);
        let failures = store.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures["77"].kind, FailureKind::Api);

        store.clear_failure("77");
        let reloaded = store_in(&dir);
        assert!(reloaded.failures().is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rate_limited_set_persists_across_loads() {
        let dir = scratch_dir();
        {
            let store = store_in(&dir);
            store.add_rate_limited("5");
            store.add_rate_limited("3");
            store.remove_rate_limited("not_present");
        }

        let store = store_in(&dir);
        assert_eq!(store.rate_limited(), vec!["3", "5"]);
        store.remove_rate_limited("5");

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.rate_limited(), vec!["3"]);
        fs::remove_dir_all(&dir).unwrap();
    }
}
