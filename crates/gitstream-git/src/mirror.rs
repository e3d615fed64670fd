//! Persistent local mirrors, one per repository.
//!
//! A mirror is a bare `--mirror` clone under the working directory, created
//! on first use and updated with `git remote update` thereafter. All git
//! subprocess work runs on the blocking pool, and operations against one
//! repository are serialized so the mirror is never touched concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use gitstream_core::types::{CommitRecord, GitActor, RepoId};

use crate::error::GitError;

/// Sha of git's canonical empty tree; the root commit diffs against it.
const EMPTY_TREE_SHA: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// `git log` format: one record per commit, fields separated by the unit
/// separator, records by the record separator. The body goes last so field
/// splitting never has to escape it.
const LOG_FORMAT: &str =
    "%H%x1f%T%x1f%P%x1f%an%x1f%ae%x1f%aI%x1f%cn%x1f%ce%x1f%cI%x1f%B%x1e";

/// Configuration shared by every mirror of a run.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Directory holding one `<owner>/<name>.git` mirror per repository.
    pub working_dir: PathBuf,
    /// Access token embedded in clone URLs. Redacted from all errors.
    pub token: String,
    /// Host serving git traffic, e.g. `https://github.com`.
    pub git_base_url: String,
}

impl MirrorConfig {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        token: impl Into<String>,
        git_base_url: impl Into<String>,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            token: token.into(),
            git_base_url: git_base_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MirrorState {
    NotCloned,
    Ready,
}

/// One repository's local mirror.
pub struct RepoMirror {
    repo: RepoId,
    dir: PathBuf,
    clone_url: String,
    token: String,
    state: RwLock<MirrorState>,
    /// Serializes clone/fetch/log/diff against this mirror.
    op_lock: tokio::sync::Mutex<()>,
}

impl RepoMirror {
    fn new(config: &MirrorConfig, repo: RepoId) -> Self {
        let dir = config
            .working_dir
            .join(repo.owner())
            .join(format!("{}.git", repo.name()));
        let state = if dir.exists() {
            MirrorState::Ready
        } else {
            MirrorState::NotCloned
        };
        Self {
            clone_url: authenticated_url(&config.git_base_url, &config.token, &repo),
            token: config.token.clone(),
            repo,
            dir,
            state: RwLock::new(state),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the repository this mirror serves.
    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    /// Returns the mirror directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensures the mirror exists and is current: clone on first use, remote
    /// update thereafter. Idempotent.
    pub async fn ensure_cloned(&self) -> Result<(), GitError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned_locked().await
    }

    async fn ensure_cloned_locked(&self) -> Result<(), GitError> {
        if *self.state.read() == MirrorState::Ready {
            debug!(repo = %self.repo, "mirror already current");
            return Ok(());
        }

        let dir = self.dir.clone();
        let url = self.clone_url.clone();
        let token = self.token.clone();
        let repo = self.repo.clone();

        info!(repo = %repo, path = ?dir, "cloning mirror");
        run_blocking(move || clone_or_update(&dir, &url, &token)).await?;

        *self.state.write() = MirrorState::Ready;
        Ok(())
    }

    /// Fetches one ref and reports whether `sha` is now present locally.
    /// `false` means the caller should fall back to the remote path.
    pub async fn fetch_ref(&self, rref: &str, sha: &str) -> Result<bool, GitError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned_locked().await?;

        let dir = self.dir.clone();
        let token = self.token.clone();
        let rref = rref.to_string();
        let sha = sha.to_string();
        let repo = self.repo.clone();

        run_blocking(move || {
            if has_commit_blocking(&dir, &token, &sha)? {
                return Ok(true);
            }
            if let Err(err) = run_git(&dir, &["fetch", "origin", &rref], &token, "fetch") {
                match err {
                    GitError::Subprocess { ref message, .. } => {
                        warn!(repo = %repo, rref = %rref, "fetch failed, falling back to remote: {message}");
                        return Ok(false);
                    },
                    other => return Err(other),
                }
            }
            has_commit_blocking(&dir, &token, &sha)
        })
        .await
    }

    /// Whether a commit object exists in the mirror.
    pub async fn has_commit(&self, sha: &str) -> Result<bool, GitError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned_locked().await?;

        let dir = self.dir.clone();
        let token = self.token.clone();
        let sha = sha.to_string();
        run_blocking(move || has_commit_blocking(&dir, &token, &sha)).await
    }

    /// Lists commits reachable from `sha`, newest first, one page at a time.
    pub async fn list_commits_from_head(
        &self,
        sha: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CommitRecord>, GitError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned_locked().await?;

        let dir = self.dir.clone();
        let token = self.token.clone();
        let sha = sha.to_string();
        let repo = self.repo.clone();

        run_blocking(move || {
            let format = format!("--pretty=format:{LOG_FORMAT}");
            let skip = format!("--skip={offset}");
            let count = format!("-n{limit}");
            let out = run_git(&dir, &["log", &format, &skip, &count, &sha], &token, "log")?;
            parse_log_output(&String::from_utf8_lossy(&out.stdout), &repo)
        })
        .await
    }

    /// Textual diff of `sha` against its first parent; the root commit diffs
    /// against the canonical empty tree.
    pub async fn diff(&self, sha: &str) -> Result<String, GitError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_cloned_locked().await?;

        let dir = self.dir.clone();
        let token = self.token.clone();
        let sha = sha.to_string();

        run_blocking(move || {
            let parent = format!("{sha}~1");
            let out = match run_git(&dir, &["diff", &parent, &sha], &token, "diff") {
                Ok(out) => out,
                Err(GitError::Subprocess { ref message, .. })
                    if message.contains("unknown revision or path not in the working tree") =>
                {
                    run_git(&dir, &["diff", EMPTY_TREE_SHA, &sha], &token, "diff")?
                },
                Err(other) => return Err(other),
            };
            // Downstream treats patches as text; scrub NULs along with any
            // invalid UTF-8.
            Ok(String::from_utf8_lossy(&out.stdout).replace('\u{0000}', "\u{FFFD}"))
        })
        .await
    }
}

impl std::fmt::Debug for RepoMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoMirror")
            .field("repo", &self.repo.path())
            .field("dir", &self.dir)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Hands out one shared mirror per repository for the lifetime of a run.
pub struct MirrorSet {
    config: MirrorConfig,
    mirrors: RwLock<HashMap<String, Arc<RepoMirror>>>,
}

impl MirrorSet {
    pub fn new(config: MirrorConfig) -> Self {
        Self {
            config,
            mirrors: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the mirror for a repository, creating it lazily.
    pub fn mirror(&self, repo: &RepoId) -> Arc<RepoMirror> {
        if let Some(mirror) = self.mirrors.read().get(&repo.path()) {
            return Arc::clone(mirror);
        }
        let mut mirrors = self.mirrors.write();
        Arc::clone(
            mirrors
                .entry(repo.path())
                .or_insert_with(|| Arc::new(RepoMirror::new(&self.config, repo.clone()))),
        )
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, GitError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GitError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| GitError::Task(e.to_string()))?
}

fn authenticated_url(base: &str, token: &str, repo: &RepoId) -> String {
    match base.split_once("://") {
        Some((scheme, host)) => format!("{scheme}://{token}@{host}/{}.git", repo.path()),
        None => format!("https://{token}@{base}/{}.git", repo.path()),
    }
}

/// Replaces the access token wherever it appears so it never reaches logs.
fn redact(text: &str, token: &str) -> String {
    if token.is_empty() {
        text.to_string()
    } else {
        text.replace(token, "<TOKEN>")
    }
}

fn run_git(
    dir: &Path,
    args: &[&str],
    token: &str,
    op: &'static str,
) -> Result<std::process::Output, GitError> {
    let out = Command::new("git").args(args).current_dir(dir).output()?;
    if out.status.success() {
        Ok(out)
    } else {
        Err(GitError::subprocess(
            op,
            out.status.code().unwrap_or(-1),
            redact(&String::from_utf8_lossy(&out.stderr), token),
        ))
    }
}

fn clone_or_update(dir: &Path, url: &str, token: &str) -> Result<(), GitError> {
    if dir.exists() {
        run_git(dir, &["remote", "update", "--prune"], token, "remote update")?;
        return Ok(());
    }

    let parent = dir
        .parent()
        .ok_or_else(|| GitError::Task(format!("mirror path {dir:?} has no parent")))?;
    std::fs::create_dir_all(parent)?;

    let target = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GitError::Task(format!("mirror path {dir:?} has no directory name")))?;
    run_git(parent, &["clone", "--mirror", url, target], token, "clone")?;
    Ok(())
}

fn has_commit_blocking(dir: &Path, token: &str, sha: &str) -> Result<bool, GitError> {
    let object = format!("{sha}^{{commit}}");
    let out = Command::new("git")
        .args(["cat-file", "-e", object.as_str()])
        .current_dir(dir)
        .output()?;
    if out.status.success() {
        return Ok(true);
    }
    let stderr = redact(&String::from_utf8_lossy(&out.stderr), token);
    if stderr.is_empty()
        || stderr.contains("bad object")
        || stderr.contains("Not a valid object name")
        || stderr.contains("could not get object info")
    {
        Ok(false)
    } else {
        Err(GitError::subprocess(
            "cat-file",
            out.status.code().unwrap_or(-1),
            stderr,
        ))
    }
}

/// Parses formatted `git log` output into commit records.
fn parse_log_output(text: &str, repo: &RepoId) -> Result<Vec<CommitRecord>, GitError> {
    let mut commits = Vec::new();
    for chunk in text.split('\u{1e}') {
        let chunk = chunk.trim_start_matches('\n');
        if chunk.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = chunk.splitn(10, '\u{1f}').collect();
        if fields.len() < 10 {
            return Err(GitError::LogParse(format!(
                "expected 10 fields, found {} in {:?}",
                fields.len(),
                chunk.chars().take(80).collect::<String>()
            )));
        }
        commits.push(CommitRecord {
            sha: fields[0].to_string(),
            tree: fields[1].to_string(),
            parents: fields[2]
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            author: GitActor {
                name: fields[3].to_string(),
                email: fields[4].to_string(),
                date: fields[5].to_string(),
            },
            committer: GitActor {
                name: fields[6].to_string(),
                email: fields[7].to_string(),
                date: fields[8].to_string(),
            },
            message: fields[9].trim_end().to_string(),
            repository: repo.path(),
        });
    }
    Ok(commits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MirrorConfig {
        MirrorConfig::new("/tmp/gitstream-test-mirrors", "s3cret", "https://github.com")
    }

    #[test]
    fn test_mirror_path_layout() {
        let set = MirrorSet::new(test_config());
        let mirror = set.mirror(&RepoId::new("acme", "widgets"));
        assert_eq!(
            mirror.dir(),
            Path::new("/tmp/gitstream-test-mirrors/acme/widgets.git")
        );
    }

    #[test]
    fn test_mirror_set_reuses_instances() {
        let set = MirrorSet::new(test_config());
        let repo = RepoId::new("acme", "widgets");
        let a = set.mirror(&repo);
        let b = set.mirror(&repo);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_authenticated_url_embeds_token() {
        let url = authenticated_url("https://github.com", "s3cret", &RepoId::new("acme", "widgets"));
        assert_eq!(url, "https://s3cret@github.com/acme/widgets.git");
    }

    #[test]
    fn test_redact_strips_token() {
        let msg = "fatal: could not read from 'https://s3cret@github.com/acme/widgets.git'";
        let clean = redact(msg, "s3cret");
        assert!(!clean.contains("s3cret"));
        assert!(clean.contains("<TOKEN>"));
        // An empty token must not blow up the replacement.
        assert_eq!(redact("plain", ""), "plain");
    }

    #[test]
    fn test_parse_log_output() {
        let repo = RepoId::new("acme", "widgets");
        let text = format!(
            "c3{s}t3{s}c2{s}Ada{s}ada@acme.dev{s}2024-03-01T10:00:00+00:00{s}Ada{s}ada@acme.dev{s}2024-03-01T10:00:00+00:00{s}third\n{r}\nc2{s}t2{s}c1{s}Ada{s}ada@acme.dev{s}2024-02-01T10:00:00+00:00{s}Bo{s}bo@acme.dev{s}2024-02-01T10:05:00+00:00{s}second\n{r}\nc1{s}t1{s}{s}Ada{s}ada@acme.dev{s}2024-01-01T10:00:00+00:00{s}Ada{s}ada@acme.dev{s}2024-01-01T10:00:00+00:00{s}first\n{r}",
            s = '\u{1f}',
            r = '\u{1e}',
        );

        let commits = parse_log_output(&text, &repo).unwrap();
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[0].sha, "c3");
        assert_eq!(commits[0].parents, vec!["c2".to_string()]);
        assert_eq!(commits[0].message, "third");
        assert_eq!(commits[1].committer.name, "Bo");
        assert!(commits[2].parents.is_empty());
        assert_eq!(commits[2].repository, "acme/widgets");
    }

    #[test]
    fn test_parse_log_output_merge_parents() {
        let repo = RepoId::new("acme", "widgets");
        let text = format!(
            "m1{s}t{s}p1 p2{s}Ada{s}a@x{s}d{s}Ada{s}a@x{s}d{s}merge\n{r}",
            s = '\u{1f}',
            r = '\u{1e}',
        );
        let commits = parse_log_output(&text, &repo).unwrap();
        assert_eq!(commits[0].parents, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn test_parse_log_output_rejects_malformed() {
        let repo = RepoId::new("acme", "widgets");
        let err = parse_log_output("not a log record", &repo).unwrap_err();
        assert!(matches!(err, GitError::LogParse(_)));
    }
}
