//! Commit graph walker: discovers every commit reachable from a set of
//! heads, delivered in paginated batches, deduplicated through a persisted
//! fetched-set.
//!
//! History can come from the remote API or from a local mirror; both sit
//! behind the same pair of traits so the walker never knows which one it is
//! paging.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use gitstream_core::state::{FetchMark, FetchedSet};
use gitstream_core::{CommitRecord, Head, RepoId, SyncError};
use gitstream_core::types::GitActor;
use gitstream_git::RepoMirror;

use crate::client::{GithubClient, RequestOptions};

/// Commits fetched per page from the local mirror.
const LOCAL_PAGE_SIZE: usize = 1000;

/// A source of commit history reachable from a head.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Opens paging over history from `head_sha`, optionally bounded by a
    /// `since` timestamp (first run only).
    async fn open(
        &self,
        repo: &RepoId,
        head_sha: &str,
        since: Option<&str>,
    ) -> Result<Box<dyn HistoryPager>, SyncError>;
}

/// One head's page iterator.
#[async_trait]
pub trait HistoryPager: Send {
    /// The next page of commits, newest first; `None` once exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<CommitRecord>>, SyncError>;
}

/// Picks remote or local history for each head.
#[async_trait]
pub trait SourcePicker: Send + Sync {
    async fn pick(&self, repo: &RepoId, head: &Head) -> Result<PickedSource, SyncError>;
}

/// A chosen history source and which path won.
pub struct PickedSource {
    pub source: Arc<dyn HistorySource>,
    /// True when the local mirror serves this head.
    pub local: bool,
}

/// Reads one commit from the API shape into the shared record.
pub fn commit_from_api(value: &Value, repo: &RepoId) -> Result<CommitRecord, SyncError> {
    let sha = value
        .get("sha")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Payload("commit record without sha".to_string()))?;
    let actor = |pointer: &str| -> GitActor {
        GitActor {
            name: string_at(value, &format!("{pointer}/name")),
            email: string_at(value, &format!("{pointer}/email")),
            date: string_at(value, &format!("{pointer}/date")),
        }
    };
    let parents = value
        .get("parents")
        .and_then(Value::as_array)
        .map(|parents| {
            parents
                .iter()
                .filter_map(|p| p.get("sha").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(CommitRecord {
        sha: sha.to_string(),
        tree: string_at(value, "/commit/tree/sha"),
        parents,
        author: actor("/commit/author"),
        committer: actor("/commit/committer"),
        message: string_at(value, "/commit/message"),
        repository: repo.path(),
    })
}

fn string_at(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// History from the commits list endpoint.
pub struct RemoteHistory {
    client: Arc<GithubClient>,
}

impl RemoteHistory {
    pub fn new(client: Arc<GithubClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HistorySource for RemoteHistory {
    async fn open(
        &self,
        repo: &RepoId,
        head_sha: &str,
        since: Option<&str>,
    ) -> Result<Box<dyn HistoryPager>, SyncError> {
        let mut url = self
            .client
            .repo_url(repo, &format!("commits?per_page=100&sha={head_sha}"));
        if let Some(since) = since {
            url.push_str(&format!("&since={since}"));
        }
        Ok(Box::new(RemotePager {
            client: Arc::clone(&self.client),
            repo: repo.clone(),
            next: Some(url),
        }))
    }
}

struct RemotePager {
    client: Arc<GithubClient>,
    repo: RepoId,
    next: Option<String>,
}

#[async_trait]
impl HistoryPager for RemotePager {
    async fn next_page(&mut self) -> Result<Option<Vec<CommitRecord>>, SyncError> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };
        let opts = RequestOptions {
            empty_on_conflict: true,
            ..RequestOptions::default()
        };
        let Some(page) = self.client.get("commits", &url, &opts).await? else {
            return Ok(None);
        };
        self.next = page.next;
        let Value::Array(items) = page.body else {
            return Err(SyncError::Payload("commit listing is not an array".to_string()));
        };
        items
            .iter()
            .map(|value| commit_from_api(value, &self.repo))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// History read out of the local mirror.
pub struct LocalHistory {
    mirror: Arc<RepoMirror>,
    page_size: usize,
}

impl LocalHistory {
    pub fn new(mirror: Arc<RepoMirror>) -> Self {
        Self {
            mirror,
            page_size: LOCAL_PAGE_SIZE,
        }
    }
}

#[async_trait]
impl HistorySource for LocalHistory {
    async fn open(
        &self,
        _repo: &RepoId,
        head_sha: &str,
        _since: Option<&str>,
    ) -> Result<Box<dyn HistoryPager>, SyncError> {
        Ok(Box::new(LocalPager {
            mirror: Arc::clone(&self.mirror),
            head: head_sha.to_string(),
            offset: 0,
            page_size: self.page_size,
            done: false,
        }))
    }
}

struct LocalPager {
    mirror: Arc<RepoMirror>,
    head: String,
    offset: usize,
    page_size: usize,
    done: bool,
}

#[async_trait]
impl HistoryPager for LocalPager {
    async fn next_page(&mut self) -> Result<Option<Vec<CommitRecord>>, SyncError> {
        if self.done {
            return Ok(None);
        }
        let commits = self
            .mirror
            .list_commits_from_head(&self.head, self.page_size, self.offset)
            .await?;
        if commits.len() < self.page_size {
            self.done = true;
        }
        self.offset += commits.len();
        if commits.is_empty() {
            Ok(None)
        } else {
            Ok(Some(commits))
        }
    }
}

/// Always takes the remote path (the commits stream).
pub struct RemoteOnlyPicker {
    source: Arc<RemoteHistory>,
}

impl RemoteOnlyPicker {
    pub fn new(client: Arc<GithubClient>) -> Self {
        Self {
            source: Arc::new(RemoteHistory::new(client)),
        }
    }
}

#[async_trait]
impl SourcePicker for RemoteOnlyPicker {
    async fn pick(&self, _repo: &RepoId, _head: &Head) -> Result<PickedSource, SyncError> {
        Ok(PickedSource {
            source: Arc::clone(&self.source) as Arc<dyn HistorySource>,
            local: false,
        })
    }
}

/// Tries to fetch the head into the mirror; falls back to the remote path
/// when the ref or object is not obtainable locally.
pub struct MirrorFirstPicker {
    mirror: Arc<RepoMirror>,
    remote: Arc<RemoteHistory>,
    local: Arc<LocalHistory>,
}

impl MirrorFirstPicker {
    pub fn new(mirror: Arc<RepoMirror>, client: Arc<GithubClient>) -> Self {
        Self {
            local: Arc::new(LocalHistory::new(Arc::clone(&mirror))),
            remote: Arc::new(RemoteHistory::new(client)),
            mirror,
        }
    }
}

#[async_trait]
impl SourcePicker for MirrorFirstPicker {
    async fn pick(&self, repo: &RepoId, head: &Head) -> Result<PickedSource, SyncError> {
        let local = self.mirror.fetch_ref(&head.rref, &head.sha).await?;
        if local {
            Ok(PickedSource {
                source: Arc::clone(&self.local) as Arc<dyn HistorySource>,
                local: true,
            })
        } else {
            info!(repo = %repo, rref = %head.rref, "head unavailable locally, using remote history");
            Ok(PickedSource {
                source: Arc::clone(&self.remote) as Arc<dyn HistorySource>,
                local: false,
            })
        }
    }
}

/// One page's worth of newly discovered commits for a head.
#[derive(Debug)]
pub struct WalkBatch {
    pub head: Head,
    /// Whether the local mirror served this head (and should serve diffs).
    pub local: bool,
    pub commits: Vec<CommitRecord>,
}

struct HeadWalk {
    head: Head,
    local: bool,
    pager: Box<dyn HistoryPager>,
    /// Parents seen but not yet fetched. The head completes only once empty.
    missing: HashSet<String>,
    first_page: bool,
    retried_without_since: bool,
}

/// Pull-based walk over every pending head of a repository.
pub struct GraphWalk {
    repo: RepoId,
    heads: VecDeque<Head>,
    fetched: FetchedSet,
    since: Option<String>,
    picker: Arc<dyn SourcePicker>,
    current: Option<HeadWalk>,
}

impl GraphWalk {
    /// Starts a walk. `since` must only carry a value on a repository's very
    /// first run; afterwards the fetched-set alone decides what is new.
    pub fn new(
        repo: RepoId,
        heads: Vec<Head>,
        fetched: FetchedSet,
        since: Option<String>,
        picker: Arc<dyn SourcePicker>,
    ) -> Self {
        Self {
            repo,
            heads: heads.into(),
            fetched,
            since,
            picker,
            current: None,
        }
    }

    /// The grown fetched-set, for persisting once the whole walk succeeded.
    pub fn into_fetched(self) -> FetchedSet {
        self.fetched
    }

    /// Next batch of newly discovered commits, or `None` when every head is
    /// closed. Heads whose sha is already fetched are skipped outright.
    pub async fn next_batch(&mut self) -> Result<Option<WalkBatch>, SyncError> {
        loop {
            let Some(mut walk) = self.current.take() else {
                let Some(head) = self.next_pending_head() else {
                    return Ok(None);
                };
                self.current = Some(self.open_head(head, self.since.clone()).await?);
                continue;
            };

            match walk.pager.next_page().await {
                Ok(Some(commits)) => {
                    walk.first_page = false;
                    let mut fresh = Vec::new();
                    for commit in commits {
                        if self.fetched.contains_key(&commit.sha) {
                            continue;
                        }
                        self.fetched.insert(commit.sha.clone(), FetchMark::Done);
                        walk.missing.remove(&commit.sha);
                        for parent in &commit.parents {
                            if !self.fetched.contains_key(parent) {
                                walk.missing.insert(parent.clone());
                            }
                        }
                        fresh.push(commit);
                    }

                    // Closed before the last page: every ancestor accounted for.
                    let complete = walk.missing.is_empty();
                    let batch = WalkBatch {
                        head: walk.head.clone(),
                        local: walk.local,
                        commits: fresh,
                    };
                    if complete {
                        debug!(rref = %batch.head.rref, "head closed");
                    } else {
                        self.current = Some(walk);
                    }
                    if batch.commits.is_empty() {
                        continue;
                    }
                    return Ok(Some(batch));
                },
                Ok(None) => {
                    if walk.missing.is_empty() {
                        debug!(rref = %walk.head.rref, "head closed at end of history");
                        continue;
                    }
                    let mut missing: Vec<String> = walk.missing.into_iter().collect();
                    missing.sort();
                    return Err(SyncError::GraphConsistency(missing.join(",")));
                },
                Err(SyncError::NotFound(msg)) if walk.first_page => {
                    // e.g. a PR base branch deleted between discovery and now.
                    info!(
                        rref = %walk.head.rref,
                        "head vanished on its first page, recording sentinel: {msg}"
                    );
                    self.fetched.insert(walk.head.sha, FetchMark::Missing);
                    continue;
                },
                Err(SyncError::Server { status, .. })
                    if walk.first_page && !walk.retried_without_since =>
                {
                    warn!(
                        rref = %walk.head.rref,
                        status, "server error on first page, retrying by sha only"
                    );
                    let mut retry = self.open_head(walk.head, None).await?;
                    retry.retried_without_since = true;
                    self.current = Some(retry);
                },
                Err(other) => return Err(other),
            }
        }
    }

    fn next_pending_head(&mut self) -> Option<Head> {
        while let Some(head) = self.heads.pop_front() {
            if self.fetched.contains_key(&head.sha) {
                debug!(rref = %head.rref, sha = %head.sha, "head already fetched, skipping");
                continue;
            }
            return Some(head);
        }
        None
    }

    async fn open_head(&self, head: Head, since: Option<String>) -> Result<HeadWalk, SyncError> {
        let picked = self.picker.pick(&self.repo, &head).await?;
        let pager = picked.source.open(&self.repo, &head.sha, since.as_deref()).await?;
        Ok(HeadWalk {
            head,
            local: picked.local,
            pager,
            missing: HashSet::new(),
            first_page: true,
            retried_without_since: false,
        })
    }
}
