//! Bookmark/state store: per-(stream, repository) checkpoints, resumability
//! pointers and legacy-layout migration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::SyncError;

/// How a commit sha ended up in the fetched set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMark {
    /// The commit was emitted.
    Done,
    /// A head that 404ed on its very first page (e.g. a deleted PR base
    /// branch); recorded so later runs skip it without re-asking.
    Missing,
}

/// Per-(repository, stream) record of already-processed commit shas.
/// Monotonically grows; the dedup/resume index for the graph walker.
pub type FetchedSet = BTreeMap<String, FetchMark>;

/// Checkpoint for one (stream, repository) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Replication-key watermark, ISO-8601.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,

    /// Commit shas already emitted, for the walker-driven streams.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fetched_commits: FetchedSet,

    /// Anything a previous version stored that we do not interpret. Preserved
    /// verbatim rather than dropped.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Bookmark {
    /// A bookmark carrying only a `since` watermark.
    pub fn since(value: impl Into<String>) -> Self {
        Self {
            since: Some(value.into()),
            ..Self::default()
        }
    }
}

/// The full persisted sync state: one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Stream interrupted mid-run, if any; lets the next run start there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currently_syncing_stream: Option<String>,

    /// Repository interrupted mid-run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currently_syncing_repo: Option<String>,

    /// Canonically keyed stream -> repository -> bookmark.
    #[serde(default)]
    pub bookmarks: BTreeMap<String, BTreeMap<String, Bookmark>>,
}

impl SyncState {
    /// Returns the bookmark for a (stream, repository) pair.
    pub fn bookmark(&self, stream: &str, repo: &str) -> Option<&Bookmark> {
        self.bookmarks.get(stream).and_then(|per_repo| per_repo.get(repo))
    }

    /// Returns the `since` watermark for a (stream, repository) pair.
    pub fn since(&self, stream: &str, repo: &str) -> Option<&str> {
        self.bookmark(stream, repo).and_then(|b| b.since.as_deref())
    }

    /// Returns a mutable bookmark, creating an empty one if absent.
    pub fn bookmark_mut(&mut self, stream: &str, repo: &str) -> &mut Bookmark {
        self.bookmarks
            .entry(stream.to_string())
            .or_default()
            .entry(repo.to_string())
            .or_default()
    }

    /// Overwrites the `since` watermark for a (stream, repository) pair.
    pub fn set_since(&mut self, stream: &str, repo: &str, value: impl Into<String>) {
        self.bookmark_mut(stream, repo).since = Some(value.into());
    }
}

/// Migrates a raw state document from the legacy `[repository][stream]`
/// nesting to the canonical `[stream][repository]` one.
///
/// The swap happens only when every outer key is a configured repository and
/// every inner key is a known stream id; any ambiguity leaves the document
/// untouched rather than guessing. Running it twice is a no-op.
pub fn migrate_state(mut doc: Value, known_streams: &[&str], repos: &[String]) -> Value {
    let Some(bookmarks) = doc.get("bookmarks").and_then(Value::as_object) else {
        return doc;
    };
    if bookmarks.is_empty() {
        return doc;
    }

    // Already canonical: every outer key is a stream id.
    if bookmarks.keys().all(|k| known_streams.contains(&k.as_str())) {
        return doc;
    }

    let outer_are_repos = bookmarks.keys().all(|k| repos.iter().any(|r| r == k));
    let inner_are_streams = bookmarks.values().all(|v| {
        v.as_object().is_some_and(|inner| {
            inner.keys().all(|k| known_streams.contains(&k.as_str()))
        })
    });
    if !outer_are_repos || !inner_are_streams {
        debug!("state document does not match the legacy layout, leaving it untouched");
        return doc;
    }

    info!("migrating legacy repository-keyed state to stream-keyed layout");
    let mut swapped: Map<String, Value> = Map::new();
    for (repo, per_stream) in bookmarks {
        let Some(per_stream) = per_stream.as_object() else {
            continue;
        };
        for (stream, bookmark) in per_stream {
            swapped
                .entry(stream.clone())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("freshly inserted object")
                .insert(repo.clone(), bookmark.clone());
        }
    }

    doc.as_object_mut()
        .expect("state root is an object")
        .insert("bookmarks".to_string(), Value::Object(swapped));
    doc
}

/// Loads and saves the state document, running migration once at load time.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: Option<PathBuf>,
}

impl StateStore {
    /// A store backed by a file on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A store with no backing file; state lives only in emitted STATE
    /// messages.
    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    /// Loads the state document, migrating the legacy layout if it applies.
    pub fn load(&self, known_streams: &[&str], repos: &[String]) -> Result<SyncState, SyncError> {
        let Some(path) = &self.path else {
            return Ok(SyncState::default());
        };
        if !path.exists() {
            return Ok(SyncState::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&raw)
            .map_err(|e| SyncError::state(format!("unparseable state file {path:?}: {e}")))?;
        let doc = migrate_state(doc, known_streams, repos);
        serde_json::from_value(doc)
            .map_err(|e| SyncError::state(format!("unexpected state shape in {path:?}: {e}")))
    }

    /// Persists the state document.
    pub fn save(&self, state: &SyncState) -> Result<(), SyncError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| SyncError::state(format!("unserializable state: {e}")))?;
        std::fs::write(path, body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STREAMS: &[&str] = &["commits", "commit_files", "issues"];

    fn repos() -> Vec<String> {
        vec!["acme/widgets".to_string(), "acme/gadgets".to_string()]
    }

    #[test]
    fn test_migrates_legacy_layout() {
        let legacy = json!({
            "bookmarks": {
                "acme/widgets": {
                    "commits": {"since": "2023-01-01T00:00:00Z"},
                    "issues": {"since": "2023-02-01T00:00:00Z"}
                },
                "acme/gadgets": {
                    "commits": {"since": "2023-03-01T00:00:00Z"}
                }
            }
        });

        let migrated = migrate_state(legacy, STREAMS, &repos());
        let state: SyncState = serde_json::from_value(migrated).unwrap();
        assert_eq!(
            state.since("commits", "acme/widgets"),
            Some("2023-01-01T00:00:00Z")
        );
        assert_eq!(
            state.since("issues", "acme/widgets"),
            Some("2023-02-01T00:00:00Z")
        );
        assert_eq!(
            state.since("commits", "acme/gadgets"),
            Some("2023-03-01T00:00:00Z")
        );
    }

    #[test]
    fn test_migration_is_idempotent() {
        let legacy = json!({
            "bookmarks": {
                "acme/widgets": {"commits": {"since": "2023-01-01T00:00:00Z"}}
            }
        });
        let once = migrate_state(legacy, STREAMS, &repos());
        let twice = migrate_state(once.clone(), STREAMS, &repos());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_ambiguous_state_left_untouched() {
        // Outer key is neither a known stream nor a configured repository.
        let ambiguous = json!({
            "bookmarks": {
                "someone/else": {"commits": {"since": "2023-01-01T00:00:00Z"}}
            }
        });
        let out = migrate_state(ambiguous.clone(), STREAMS, &repos());
        assert_eq!(out, ambiguous);

        // Outer keys are repositories but one inner key is not a stream.
        let ambiguous = json!({
            "bookmarks": {
                "acme/widgets": {"mystery": {"since": "2023-01-01T00:00:00Z"}}
            }
        });
        let out = migrate_state(ambiguous.clone(), STREAMS, &repos());
        assert_eq!(out, ambiguous);
    }

    #[test]
    fn test_canonical_state_untouched() {
        let canonical = json!({
            "bookmarks": {
                "commits": {"acme/widgets": {"since": "2023-01-01T00:00:00Z"}}
            }
        });
        let out = migrate_state(canonical.clone(), STREAMS, &repos());
        assert_eq!(out, canonical);
    }

    #[test]
    fn test_fetched_set_round_trip() {
        let mut state = SyncState::default();
        let bookmark = state.bookmark_mut("commit_files", "acme/widgets");
        bookmark.fetched_commits.insert("abc".to_string(), FetchMark::Done);
        bookmark.fetched_commits.insert("def".to_string(), FetchMark::Missing);

        let raw = serde_json::to_value(&state).unwrap();
        assert_eq!(
            raw["bookmarks"]["commit_files"]["acme/widgets"]["fetched_commits"]["abc"],
            json!("done")
        );

        let back: SyncState = serde_json::from_value(raw).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_unknown_bookmark_fields_preserved() {
        let doc = json!({
            "bookmarks": {
                "commits": {
                    "acme/widgets": {"since": "2023-01-01T00:00:00Z", "cursor": "p5"}
                }
            }
        });
        let state: SyncState = serde_json::from_value(doc).unwrap();
        let bookmark = state.bookmark("commits", "acme/widgets").unwrap();
        assert_eq!(bookmark.extra.get("cursor"), Some(&json!("p5")));

        let round = serde_json::to_value(&state).unwrap();
        assert_eq!(round["bookmarks"]["commits"]["acme/widgets"]["cursor"], json!("p5"));
    }

    #[test]
    fn test_store_load_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let loaded = store.load(STREAMS, &repos()).unwrap();
        assert_eq!(loaded, SyncState::default());

        let mut state = SyncState::default();
        state.set_since("commits", "acme/widgets", "2024-05-01T12:00:00Z");
        state.currently_syncing_repo = Some("acme/widgets".to_string());
        store.save(&state).unwrap();

        let back = store.load(STREAMS, &repos()).unwrap();
        assert_eq!(back, state);
    }
}
