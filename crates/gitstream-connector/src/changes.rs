//! Per-commit file changes, computed through either of two interchangeable
//! paths: the local mirror's diff plus the diff parser, or the remote commit
//! detail endpoint. Both produce the same `FileChange` structure.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use gitstream_core::types::{ChangeType, CommitRecord, FileChange, RepoId};
use gitstream_core::SyncError;
use gitstream_git::{RepoMirror, parse_diff};

use crate::client::{GithubClient, RequestOptions};

/// Diff computations in flight against the local mirror.
pub const LOCAL_DIFF_CONCURRENCY: usize = 64;

/// The remote path stays serial so page-sized bursts cannot trip the
/// secondary rate limit.
pub const REMOTE_DIFF_CONCURRENCY: usize = 1;

/// Computes the file-level changes of one commit.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn changes(
        &self,
        repo: &RepoId,
        commit: &CommitRecord,
    ) -> Result<Vec<FileChange>, SyncError>;
}

/// Diff text from the mirror, reconstructed by the parser.
pub struct LocalChanges {
    mirror: Arc<RepoMirror>,
}

impl LocalChanges {
    pub fn new(mirror: Arc<RepoMirror>) -> Self {
        Self { mirror }
    }
}

#[async_trait]
impl ChangeSource for LocalChanges {
    async fn changes(
        &self,
        repo: &RepoId,
        commit: &CommitRecord,
    ) -> Result<Vec<FileChange>, SyncError> {
        let text = self.mirror.diff(&commit.sha).await.map_err(SyncError::from)?;
        let changes = parse_diff(&text).map_err(SyncError::from)?;
        Ok(changes
            .into_iter()
            .map(|change| change.attach(repo, &commit.sha))
            .collect())
    }
}

/// File listing from the commit detail endpoint. Listings over 300 files
/// paginate; each page repeats the commit and varies only the files.
pub struct RemoteChanges {
    client: Arc<GithubClient>,
}

impl RemoteChanges {
    pub fn new(client: Arc<GithubClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChangeSource for RemoteChanges {
    async fn changes(
        &self,
        repo: &RepoId,
        commit: &CommitRecord,
    ) -> Result<Vec<FileChange>, SyncError> {
        let url = self
            .client
            .repo_url(repo, &format!("commits/{}?per_page=100", commit.sha));
        let opts = RequestOptions {
            skip_not_found: true,
            ..RequestOptions::default()
        };
        let mut pager = self.client.paginate_with("commit_files", url, opts);

        let mut changes = Vec::new();
        while let Some(page) = pager.next_page().await? {
            for detail in page {
                let Some(files) = detail.get("files").and_then(Value::as_array) else {
                    continue;
                };
                for file in files {
                    changes.push(file_change_from_api(file)?.attach(repo, &commit.sha));
                }
            }
        }
        Ok(changes)
    }
}

/// Reads one entry of the API `files` listing into the shared structure,
/// reconstructing the flags the API leaves implicit.
pub fn file_change_from_api(value: &Value) -> Result<FileChange, SyncError> {
    let filename = value
        .get("filename")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Payload("file change without filename".to_string()))?;
    let status = value.get("status").and_then(Value::as_str).unwrap_or("");
    let count = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
    let additions = count("additions");
    let deletions = count("deletions");
    let changes = count("changes");
    let patch = value.get("patch").and_then(Value::as_str).map(str::to_string);

    // Zero-change "modified" entries with no patch are binary blobs; the API
    // reports counts only for text. Renames and empty files also carry zero
    // counts, so the status matters.
    let is_binary =
        patch.is_none() && changes == 0 && additions == 0 && deletions == 0 && status == "modified";

    // A missing patch with real change counts means the patch was too large
    // for the API to inline.
    let is_large_patch = patch.is_none() && !is_binary && (additions > 0 || deletions > 0);

    let change_type = match status {
        "added" => ChangeType::Add,
        "removed" => ChangeType::Delete,
        // "renamed" wins over "modified" upstream, so decide from the counts
        // whether any content actually changed.
        _ if additions > 0 || deletions > 0 || is_binary || is_large_patch => ChangeType::Edit,
        _ => ChangeType::None,
    };

    Ok(FileChange {
        id: String::new(),
        filename: filename.to_string(),
        previous_filename: value
            .get("previous_filename")
            .and_then(Value::as_str)
            .map(str::to_string),
        additions,
        deletions,
        change_type,
        is_binary,
        is_large_patch,
        patch,
        commit_sha: String::new(),
        repository: String::new(),
    })
}

/// Computes changes for a batch of commits over a bounded pool, returning
/// results in submission order regardless of completion order, so emission
/// stays deterministic.
pub async fn compute_changes(
    source: Arc<dyn ChangeSource>,
    repo: &RepoId,
    commits: &[CommitRecord],
    concurrency: usize,
) -> Result<Vec<Vec<FileChange>>, SyncError> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let work = commits.iter().map(|commit| {
        let source = Arc::clone(&source);
        let semaphore = Arc::clone(&semaphore);
        let repo = repo.clone();
        let commit = commit.clone();
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| SyncError::Transient(e.to_string()))?;
            source.changes(&repo, &commit).await
        }
    });
    futures::future::try_join_all(work).await
}
