//! Per-run context: repository metadata, branch tips and PR heads.
//!
//! One `RunContext` lives exactly as long as a sync run, so nothing leaks
//! across runs. The branches and pull-request streams feed it as they emit;
//! the commit graph walker reads from it, fetching on demand whenever a
//! stream was not selected this run.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use gitstream_core::{Head, RepoId, SyncError};

use crate::client::GithubClient;

/// Repository-level metadata the run needs.
#[derive(Debug, Clone)]
pub struct RepoMeta {
    pub default_branch: String,
}

/// One branch tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHead {
    pub name: String,
    pub sha: String,
    pub is_default: bool,
}

/// The shas a pull request contributes to head discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrHead {
    pub number: u64,
    pub head_sha: String,
    pub head_ref: String,
    pub base_sha: String,
    pub base_ref: String,
}

/// Mutable caches scoped to a single run.
#[derive(Default)]
pub struct RunContext {
    meta: RwLock<HashMap<String, RepoMeta>>,
    branches: RwLock<HashMap<String, Vec<BranchHead>>>,
    pulls: RwLock<HashMap<String, Vec<PrHead>>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository metadata, fetched once per run.
    pub async fn repo_meta(
        &self,
        client: &GithubClient,
        repo: &RepoId,
    ) -> Result<RepoMeta, SyncError> {
        if let Some(meta) = self.meta.read().get(&repo.path()) {
            return Ok(meta.clone());
        }
        let url = client.url(&format!("repos/{}", repo.path()));
        let page = client
            .get("repo_metadata", &url, &Default::default())
            .await?
            .ok_or_else(|| SyncError::not_found(repo.path()))?;
        let default_branch = page
            .body
            .get("default_branch")
            .and_then(Value::as_str)
            .unwrap_or("main")
            .to_string();
        let meta = RepoMeta { default_branch };
        self.meta.write().insert(repo.path(), meta.clone());
        Ok(meta)
    }

    /// Caches one branch tip as the branches stream emits it.
    pub fn record_branch(&self, repo: &RepoId, head: BranchHead) {
        self.branches.write().entry(repo.path()).or_default().push(head);
    }

    /// Caches one pull request's shas as the pull-request stream emits it.
    pub fn record_pull(&self, repo: &RepoId, head: PrHead) {
        self.pulls.write().entry(repo.path()).or_default().push(head);
    }

    /// Branch tips for a repository, fetched if no stream cached them.
    pub async fn branch_heads(
        &self,
        client: &GithubClient,
        repo: &RepoId,
    ) -> Result<Vec<BranchHead>, SyncError> {
        if let Some(cached) = self.branches.read().get(&repo.path()) {
            return Ok(cached.clone());
        }
        let meta = self.repo_meta(client, repo).await?;
        let mut heads = Vec::new();
        let mut pager = client.paginate("branches", client.repo_url(repo, "branches?per_page=100"));
        while let Some(page) = pager.next_page().await? {
            for value in page {
                heads.push(branch_from_api(&value, &meta.default_branch)?);
            }
        }
        self.branches.write().insert(repo.path(), heads.clone());
        Ok(heads)
    }

    /// Pull-request heads for a repository, fetched if no stream cached them.
    /// A partially-filled cache (a PR stream that stopped at its bookmark) is
    /// used as-is: shas of older PRs were already walked in a previous run.
    pub async fn pr_heads(
        &self,
        client: &GithubClient,
        repo: &RepoId,
    ) -> Result<Vec<PrHead>, SyncError> {
        if let Some(cached) = self.pulls.read().get(&repo.path()) {
            return Ok(cached.clone());
        }
        let mut heads = Vec::new();
        let mut pager = client.paginate(
            "pull_requests",
            client.repo_url(repo, "pulls?per_page=100&state=all"),
        );
        while let Some(page) = pager.next_page().await? {
            for value in page {
                heads.push(pull_from_api(&value)?);
            }
        }
        self.pulls.write().insert(repo.path(), heads.clone());
        Ok(heads)
    }

    /// Every commit-graph entry point for a repository: branch tips plus PR
    /// head and base shas, deduplicated by sha. A PR into a branch that was
    /// deleted since survives only through its base sha, so bases count.
    pub async fn heads_for_commits(
        &self,
        client: &GithubClient,
        repo: &RepoId,
    ) -> Result<Vec<Head>, SyncError> {
        let branches = self.branch_heads(client, repo).await?;
        let pulls = self.pr_heads(client, repo).await?;
        let heads = build_head_set(&branches, &pulls);
        debug!(repo = %repo, count = heads.len(), "discovered commit heads");
        Ok(heads)
    }
}

/// Deduplicates branch tips and PR shas into the head list, first ref wins.
pub fn build_head_set(branches: &[BranchHead], pulls: &[PrHead]) -> Vec<Head> {
    let mut seen = std::collections::HashSet::new();
    let mut heads = Vec::new();
    let mut push = |rref: String, sha: &str| {
        if !sha.is_empty() && seen.insert(sha.to_string()) {
            heads.push(Head::new(rref, sha));
        }
    };

    for branch in branches {
        push(format!("refs/heads/{}", branch.name), &branch.sha);
    }
    for pr in pulls {
        push(format!("refs/pull/{}/head", pr.number), &pr.head_sha);
        push(format!("refs/heads/{}", pr.base_ref), &pr.base_sha);
    }
    heads
}

/// Reads one branch record from the API shape.
pub fn branch_from_api(value: &Value, default_branch: &str) -> Result<BranchHead, SyncError> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Payload("branch record without name".to_string()))?;
    let sha = value
        .pointer("/commit/sha")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Payload(format!("branch {name} without commit sha")))?;
    Ok(BranchHead {
        name: name.to_string(),
        sha: sha.to_string(),
        is_default: name == default_branch,
    })
}

/// Reads one pull-request record from the API shape.
pub fn pull_from_api(value: &Value) -> Result<PrHead, SyncError> {
    let number = value
        .get("number")
        .and_then(Value::as_u64)
        .ok_or_else(|| SyncError::Payload("pull request without number".to_string()))?;
    let field = |pointer: &str| -> Result<String, SyncError> {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Payload(format!("pull request #{number} missing {pointer}")))
    };
    Ok(PrHead {
        number,
        head_sha: field("/head/sha")?,
        head_ref: field("/head/ref")?,
        base_sha: field("/base/sha")?,
        base_ref: field("/base/ref")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branch(name: &str, sha: &str) -> BranchHead {
        BranchHead {
            name: name.to_string(),
            sha: sha.to_string(),
            is_default: name == "main",
        }
    }

    fn pr(number: u64, head_sha: &str, base_ref: &str, base_sha: &str) -> PrHead {
        PrHead {
            number,
            head_sha: head_sha.to_string(),
            head_ref: format!("feature-{number}"),
            base_sha: base_sha.to_string(),
            base_ref: base_ref.to_string(),
        }
    }

    #[test]
    fn test_head_set_dedups_by_sha() {
        let branches = vec![branch("main", "aaa"), branch("dev", "bbb")];
        // PR 7's base is the main tip, so its sha must not repeat; its head
        // is new. PR 8 targets a deleted branch whose sha survives only here.
        let pulls = vec![pr(7, "ccc", "main", "aaa"), pr(8, "ddd", "archived", "eee")];

        let heads = build_head_set(&branches, &pulls);
        let shas: Vec<&str> = heads.iter().map(|h| h.sha.as_str()).collect();
        assert_eq!(shas, vec!["aaa", "bbb", "ccc", "ddd", "eee"]);

        let refs: Vec<&str> = heads.iter().map(|h| h.rref.as_str()).collect();
        assert!(refs.contains(&"refs/pull/7/head"));
        assert!(refs.contains(&"refs/heads/archived"));
        // First ref wins for a duplicated sha.
        assert_eq!(heads[0].rref, "refs/heads/main");
    }

    #[test]
    fn test_branch_from_api() {
        let value = json!({"name": "main", "commit": {"sha": "abc"}});
        let head = branch_from_api(&value, "main").unwrap();
        assert!(head.is_default);
        assert_eq!(head.sha, "abc");

        let bad = json!({"name": "main"});
        assert!(branch_from_api(&bad, "main").is_err());
    }

    #[test]
    fn test_pull_from_api() {
        let value = json!({
            "number": 12,
            "head": {"sha": "h", "ref": "feature"},
            "base": {"sha": "b", "ref": "main"}
        });
        let head = pull_from_api(&value).unwrap();
        assert_eq!(head.number, 12);
        assert_eq!(head.base_ref, "main");
    }

    #[test]
    fn test_record_branch_feeds_cache() {
        let ctx = RunContext::new();
        let repo = RepoId::new("acme", "widgets");
        ctx.record_branch(&repo, branch("main", "aaa"));
        assert_eq!(ctx.branches.read().get("acme/widgets").unwrap().len(), 1);
    }
}
