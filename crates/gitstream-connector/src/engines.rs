//! Generic stream engines: full-table, incremental-ascending and
//! incremental-descending, plus per-parent child replication.
//!
//! Bookmark rules:
//! - Ascending/unordered sources iterate everything, emit records at or after
//!   the window minimum, and persist the maximum key seen — once, at stream
//!   end, never per record.
//! - Descending sources take the first record's key as the candidate, stop
//!   paging the instant a key is strictly older than the previous bookmark,
//!   and persist the candidate at stream end. A partial run can only re-see
//!   the newest data again, never miss any.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use gitstream_core::stream::StreamDescriptor;
use gitstream_core::{Emitter, RepoId, Selection, SyncError, SyncState};

use crate::client::{GithubClient, RequestOptions};
use crate::registry::{Registry, decorate};

/// Everything an engine needs for one stream/repository unit.
pub struct EngineCtx<'a> {
    pub client: &'a GithubClient,
    pub emitter: &'a dyn Emitter,
    pub registry: &'a Registry,
    pub selection: &'a Selection,
    pub start_date: Option<&'a str>,
}

/// Stream-specific tweak applied to each record before emission.
pub type RecordHook<'a> = &'a (dyn Fn(&mut Value) + Sync);

/// Parses a replication-key or bookmark timestamp. Accepts RFC 3339 and the
/// bare dates start-date configs tend to use.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Running state for an ascending/unordered stream.
pub struct AscendingCursor {
    window_min: Option<DateTime<Utc>>,
    max_raw: Option<String>,
    max_ts: Option<DateTime<Utc>>,
}

impl AscendingCursor {
    /// Starts from the window minimum; it doubles as the bookmark floor when
    /// the stream turns out empty.
    pub fn new(window_min: Option<&str>) -> Self {
        let ts = window_min.and_then(parse_ts);
        Self {
            window_min: ts,
            max_raw: window_min.map(str::to_string),
            max_ts: ts,
        }
    }

    /// Tracks the maximum key; returns whether this record is inside the
    /// window and should be emitted.
    pub fn observe(&mut self, key: &str) -> bool {
        let Some(ts) = parse_ts(key) else {
            return false;
        };
        if self.max_ts.is_none_or(|max| ts >= max) {
            self.max_ts = Some(ts);
            self.max_raw = Some(key.to_string());
        }
        self.window_min.is_none_or(|min| ts >= min)
    }

    /// The bookmark to persist after the stream completed.
    pub fn final_bookmark(&self) -> Option<&str> {
        self.max_raw.as_deref()
    }
}

/// Verdict for one record of a descending stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Emit,
    /// Everything from here on is guaranteed older; stop paging.
    Stop,
}

/// Running state for a descending stream.
pub struct DescendingCursor {
    threshold: Option<DateTime<Utc>>,
    candidate: Option<String>,
    fallback: Option<String>,
}

impl DescendingCursor {
    pub fn new(threshold: Option<&str>, fallback: Option<String>) -> Self {
        Self {
            threshold: threshold.and_then(parse_ts),
            candidate: None,
            fallback,
        }
    }

    pub fn observe(&mut self, key: &str) -> Decision {
        if self.candidate.is_none() {
            // First record of a descending source is the newest.
            self.candidate = Some(key.to_string());
        }
        match (parse_ts(key), self.threshold) {
            (Some(ts), Some(threshold)) if ts < threshold => Decision::Stop,
            _ => Decision::Emit,
        }
    }

    /// The candidate, or the unchanged previous bookmark when no records
    /// arrived.
    pub fn final_bookmark(&self) -> Option<&str> {
        self.candidate.as_deref().or(self.fallback.as_deref())
    }
}

/// Minimum bookmark across a stream and its selected descendants, so
/// resuming a parent never skips records a paused child still needs.
pub fn min_bookmark(
    registry: &Registry,
    selection: &Selection,
    state: &SyncState,
    stream_id: &str,
    repo_path: &str,
    start_date: Option<&str>,
) -> Option<String> {
    let mut candidates = Vec::new();
    collect_bookmarks(registry, selection, state, stream_id, repo_path, start_date, &mut candidates);
    candidates
        .into_iter()
        .min_by_key(|raw| parse_ts(raw).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

fn collect_bookmarks(
    registry: &Registry,
    selection: &Selection,
    state: &SyncState,
    stream_id: &str,
    repo_path: &str,
    start_date: Option<&str>,
    out: &mut Vec<String>,
) {
    if selection.is_selected(stream_id) {
        let since = state
            .since(stream_id, repo_path)
            .map(str::to_string)
            .or_else(|| start_date.map(str::to_string));
        if let Some(since) = since {
            out.push(since);
        }
    }
    if let Some(desc) = registry.get(stream_id) {
        for child in desc.children {
            collect_bookmarks(registry, selection, state, child, repo_path, start_date, out);
        }
    }
}

/// Writes one bookmark value for a stream and all of its selected
/// descendants.
pub fn write_bookmarks(
    registry: &Registry,
    selection: &Selection,
    state: &mut SyncState,
    stream_id: &str,
    repo_path: &str,
    value: &str,
) {
    if selection.is_selected(stream_id) {
        state.set_since(stream_id, repo_path, value);
    }
    if let Some(desc) = registry.get(stream_id) {
        for child in desc.children {
            write_bookmarks(registry, selection, state, child, repo_path, value);
        }
    }
}

/// Resolves `{field}` placeholders in a path template. `{org}` comes from the
/// repository; everything else from the parent record.
pub fn fill_template(
    template: &str,
    repo: &RepoId,
    parent: Option<&Value>,
) -> Result<String, SyncError> {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(SyncError::config(format!("unterminated placeholder in {template:?}")));
        };
        let name = &after[..end];
        let value = if name == "org" {
            repo.owner().to_string()
        } else {
            parent
                .and_then(|p| p.get(name))
                .and_then(scalar_to_string)
                .ok_or_else(|| {
                    SyncError::Payload(format!("parent record missing field {name:?} for {template:?}"))
                })?
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn stream_request_options(desc: &StreamDescriptor) -> RequestOptions {
    RequestOptions {
        skip_not_found: true,
        empty_on_conflict: true,
        accept: desc.accept,
    }
}

fn stream_url(
    client: &GithubClient,
    desc: &StreamDescriptor,
    repo: &RepoId,
    since: Option<&str>,
) -> Result<String, SyncError> {
    let path = fill_template(desc.path, repo, None)?;
    let mut url = if desc.org_scoped {
        client.url(&path)
    } else {
        client.repo_url(repo, &path)
    };
    if desc.filter_param {
        if let Some(since) = since {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&format!("since={since}"));
        }
    }
    Ok(url)
}

fn inject_repo(record: &mut Value, repo: &RepoId) {
    if let Some(obj) = record.as_object_mut() {
        obj.insert("_sdc_repository".to_string(), Value::String(repo.path()));
    }
}

fn replication_key<'v>(desc: &StreamDescriptor, record: &'v Value) -> Option<&'v str> {
    record.get(desc.replication_key?).and_then(Value::as_str)
}

fn emit_record(
    ctx: &EngineCtx<'_>,
    desc: &StreamDescriptor,
    record: &Value,
    extracted_at: DateTime<Utc>,
) -> Result<(), SyncError> {
    match (ctx.selection.fields(desc.id), record.as_object()) {
        (Some(fields), Some(obj)) => {
            // Key fields and the repository marker always survive projection.
            let mut projected = serde_json::Map::new();
            for (key, value) in obj {
                if fields.iter().any(|f| f == key)
                    || desc.key_fields.contains(&key.as_str())
                    || key == "_sdc_repository"
                {
                    projected.insert(key.clone(), value.clone());
                }
            }
            ctx.emitter.record(desc.id, &Value::Object(projected), extracted_at)
        },
        _ => ctx.emitter.record(desc.id, record, extracted_at),
    }
}

/// Replicates the children of one emitted parent record, recursively.
pub fn sync_children<'a>(
    ctx: &'a EngineCtx<'a>,
    parent: &'a StreamDescriptor,
    parent_record: &'a Value,
    repo: &'a RepoId,
) -> BoxFuture<'a, Result<(), SyncError>> {
    Box::pin(async move {
        for child_id in parent.children {
            let Some(child) = ctx.registry.get(child_id) else {
                continue;
            };
            if !ctx.registry.is_needed(child_id, ctx.selection) {
                continue;
            }

            let path = fill_template(child.path, repo, Some(parent_record))?;
            let url = if child.org_scoped {
                ctx.client.url(&path)
            } else {
                ctx.client.repo_url(repo, &path)
            };
            let mut pager =
                ctx.client
                    .paginate_with(child.id.to_string(), url, stream_request_options(child));

            while let Some(records) = pager.next_page().await? {
                let extracted_at = Utc::now();
                for mut record in records {
                    inject_repo(&mut record, repo);
                    decorate(child.id, Some(parent_record), &mut record);
                    if ctx.selection.is_selected(child.id) {
                        emit_record(ctx, child, &record, extracted_at)?;
                    }
                    if !child.children.is_empty() {
                        sync_children(ctx, child, &record, repo).await?;
                    }
                }
            }
        }
        Ok(())
    })
}

/// Replicates a full-table stream: every record, every run, no bookmark.
pub async fn sync_full_table(
    ctx: &EngineCtx<'_>,
    desc: &StreamDescriptor,
    repo: &RepoId,
    hook: Option<RecordHook<'_>>,
) -> Result<(), SyncError> {
    let url = stream_url(ctx.client, desc, repo, None)?;
    let mut pager = ctx
        .client
        .paginate_with(desc.id.to_string(), url, stream_request_options(desc));

    while let Some(records) = pager.next_page().await? {
        let extracted_at = Utc::now();
        for mut record in records {
            inject_repo(&mut record, repo);
            decorate(desc.id, None, &mut record);
            if let Some(hook) = hook {
                hook(&mut record);
            }
            if ctx.selection.is_selected(desc.id) {
                emit_record(ctx, desc, &record, extracted_at)?;
            }
            sync_children(ctx, desc, &record, repo).await?;
        }
    }
    Ok(())
}

/// Replicates an ascending/unordered incremental stream.
pub async fn sync_ascending(
    ctx: &EngineCtx<'_>,
    desc: &StreamDescriptor,
    repo: &RepoId,
    state: &mut SyncState,
    hook: Option<RecordHook<'_>>,
) -> Result<(), SyncError> {
    let repo_path = repo.path();
    let window = min_bookmark(ctx.registry, ctx.selection, state, desc.id, &repo_path, ctx.start_date);
    let mut cursor = AscendingCursor::new(window.as_deref());

    let url = stream_url(ctx.client, desc, repo, window.as_deref())?;
    let mut pager = ctx
        .client
        .paginate_with(desc.id.to_string(), url, stream_request_options(desc));

    while let Some(records) = pager.next_page().await? {
        let extracted_at = Utc::now();
        for mut record in records {
            let Some(key) = replication_key(desc, &record).map(str::to_string) else {
                warn!(stream = desc.id, "record missing replication key, skipping");
                continue;
            };
            if !cursor.observe(&key) {
                continue;
            }
            inject_repo(&mut record, repo);
            decorate(desc.id, None, &mut record);
            if let Some(hook) = hook {
                hook(&mut record);
            }
            if ctx.selection.is_selected(desc.id) {
                emit_record(ctx, desc, &record, extracted_at)?;
            }
            sync_children(ctx, desc, &record, repo).await?;
        }
    }

    if let Some(bookmark) = cursor.final_bookmark() {
        let bookmark = bookmark.to_string();
        write_bookmarks(ctx.registry, ctx.selection, state, desc.id, &repo_path, &bookmark);
    }
    Ok(())
}

/// Replicates a descending incremental stream, stopping at the first record
/// older than the previous bookmark.
pub async fn sync_descending(
    ctx: &EngineCtx<'_>,
    desc: &StreamDescriptor,
    repo: &RepoId,
    state: &mut SyncState,
    hook: Option<RecordHook<'_>>,
) -> Result<(), SyncError> {
    let repo_path = repo.path();
    let threshold =
        min_bookmark(ctx.registry, ctx.selection, state, desc.id, &repo_path, ctx.start_date);
    let fallback = state
        .since(desc.id, &repo_path)
        .map(str::to_string)
        .or_else(|| ctx.start_date.map(str::to_string));
    let mut cursor = DescendingCursor::new(threshold.as_deref(), fallback);

    let url = stream_url(ctx.client, desc, repo, None)?;
    let mut pager = ctx
        .client
        .paginate_with(desc.id.to_string(), url, stream_request_options(desc));

    'pages: while let Some(records) = pager.next_page().await? {
        let extracted_at = Utc::now();
        for mut record in records {
            let Some(key) = replication_key(desc, &record).map(str::to_string) else {
                warn!(stream = desc.id, "record missing replication key, skipping");
                continue;
            };
            if cursor.observe(&key) == Decision::Stop {
                break 'pages;
            }
            inject_repo(&mut record, repo);
            decorate(desc.id, None, &mut record);
            if let Some(hook) = hook {
                hook(&mut record);
            }
            if ctx.selection.is_selected(desc.id) {
                emit_record(ctx, desc, &record, extracted_at)?;
            }
            sync_children(ctx, desc, &record, repo).await?;
        }
    }

    if let Some(bookmark) = cursor.final_bookmark() {
        let bookmark = bookmark.to_string();
        write_bookmarks(ctx.registry, ctx.selection, state, desc.id, &repo_path, &bookmark);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ts_variants() {
        assert!(parse_ts("2024-05-01T12:30:00Z").is_some());
        assert!(parse_ts("2018-11-14T13:21:20.700360Z").is_some());
        assert!(parse_ts("2024-05-01").is_some());
        assert!(parse_ts("not a date").is_none());
    }

    #[test]
    fn test_ascending_cursor_tracks_max_and_window() {
        let mut cursor = AscendingCursor::new(Some("2024-02-01T00:00:00Z"));
        // Older than the window: tracked for max, not emitted.
        assert!(!cursor.observe("2024-01-15T00:00:00Z"));
        assert!(cursor.observe("2024-02-10T00:00:00Z"));
        assert!(cursor.observe("2024-03-01T00:00:00Z"));
        // Unordered source: an older-but-in-window record still emits and
        // must not regress the max.
        assert!(cursor.observe("2024-02-05T00:00:00Z"));
        assert_eq!(cursor.final_bookmark(), Some("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn test_ascending_cursor_empty_stream_keeps_window() {
        let cursor = AscendingCursor::new(Some("2024-02-01T00:00:00Z"));
        assert_eq!(cursor.final_bookmark(), Some("2024-02-01T00:00:00Z"));
    }

    #[test]
    fn test_descending_cursor_stops_below_threshold() {
        let mut cursor = DescendingCursor::new(Some("2024-02-01T00:00:00Z"), None);
        assert_eq!(cursor.observe("2024-03-01T00:00:00Z"), Decision::Emit);
        assert_eq!(cursor.observe("2024-02-02T00:00:00Z"), Decision::Emit);
        // Strictly older than the threshold: stop, everything further is
        // guaranteed older still.
        assert_eq!(cursor.observe("2024-01-31T00:00:00Z"), Decision::Stop);
        // Candidate is the first (newest) record.
        assert_eq!(cursor.final_bookmark(), Some("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn test_descending_cursor_equal_key_still_emits() {
        let mut cursor = DescendingCursor::new(Some("2024-02-01T00:00:00Z"), None);
        assert_eq!(cursor.observe("2024-02-01T00:00:00Z"), Decision::Emit);
    }

    #[test]
    fn test_descending_cursor_falls_back_when_empty() {
        let cursor = DescendingCursor::new(
            Some("2024-02-01T00:00:00Z"),
            Some("2024-02-01T00:00:00Z".to_string()),
        );
        assert_eq!(cursor.final_bookmark(), Some("2024-02-01T00:00:00Z"));
    }

    #[test]
    fn test_min_bookmark_spans_children() {
        let registry = Registry::new();
        let selection = Selection::all(&["pull_requests", "reviews", "review_comments"]);
        let mut state = SyncState::default();
        state.set_since("pull_requests", "acme/widgets", "2024-03-01T00:00:00Z");
        state.set_since("reviews", "acme/widgets", "2024-01-01T00:00:00Z");
        state.set_since("review_comments", "acme/widgets", "2024-02-01T00:00:00Z");

        let min = min_bookmark(
            &registry,
            &selection,
            &state,
            "pull_requests",
            "acme/widgets",
            None,
        );
        assert_eq!(min.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_min_bookmark_ignores_unselected_children() {
        let registry = Registry::new();
        let selection = Selection::all(&["pull_requests"]);
        let mut state = SyncState::default();
        state.set_since("pull_requests", "acme/widgets", "2024-03-01T00:00:00Z");
        state.set_since("reviews", "acme/widgets", "2020-01-01T00:00:00Z");

        let min = min_bookmark(
            &registry,
            &selection,
            &state,
            "pull_requests",
            "acme/widgets",
            None,
        );
        assert_eq!(min.as_deref(), Some("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn test_write_bookmarks_covers_selected_descendants() {
        let registry = Registry::new();
        let selection = Selection::all(&["pull_requests", "reviews"]);
        let mut state = SyncState::default();

        write_bookmarks(
            &registry,
            &selection,
            &mut state,
            "pull_requests",
            "acme/widgets",
            "2024-04-01T00:00:00Z",
        );
        assert_eq!(
            state.since("pull_requests", "acme/widgets"),
            Some("2024-04-01T00:00:00Z")
        );
        assert_eq!(state.since("reviews", "acme/widgets"), Some("2024-04-01T00:00:00Z"));
        // Unselected child untouched.
        assert_eq!(state.since("review_comments", "acme/widgets"), None);
    }

    #[test]
    fn test_fill_template() {
        let repo = RepoId::new("acme", "widgets");
        let parent = serde_json::json!({"number": 42, "slug": "platform"});

        assert_eq!(
            fill_template("pulls/{number}/reviews?per_page=100", &repo, Some(&parent)).unwrap(),
            "pulls/42/reviews?per_page=100"
        );
        assert_eq!(
            fill_template("orgs/{org}/teams/{slug}/members", &repo, Some(&parent)).unwrap(),
            "orgs/acme/teams/platform/members"
        );
        assert!(fill_template("pulls/{missing}/reviews", &repo, Some(&parent)).is_err());
        assert!(fill_template("pulls/{oops", &repo, None).is_err());
    }
}
