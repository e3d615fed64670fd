//! Repository, commit and file-change records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Identifies one repository as `owner/name`. The unit of sync ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId {
    owner: String,
    name: String,
}

impl RepoId {
    /// Creates a RepoId from its two components.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Returns the owning organization or user.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the repository name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the `owner/name` path used in API URLs and state keys.
    pub fn path(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            },
            _ => Err(SyncError::config(format!(
                "repository must be of the form owner/name, got {s:?}"
            ))),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// One entry point into the commit graph: a branch tip or a PR base/head sha.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    /// Full ref name, e.g. `refs/heads/main` or `refs/pull/42/head`.
    pub rref: String,
    /// The commit sha the ref pointed at when discovered.
    pub sha: String,
}

impl Head {
    /// Creates a new head.
    pub fn new(rref: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            rref: rref.into(),
            sha: sha.into(),
        }
    }
}

/// Author or committer identity on a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitActor {
    pub name: String,
    pub email: String,
    /// ISO-8601 timestamp.
    pub date: String,
}

/// One commit, immutable once fetched. Unique per repository by sha.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    /// Root tree sha.
    pub tree: String,
    /// Parent shas, empty for a root commit.
    #[serde(default)]
    pub parents: Vec<String>,
    pub author: GitActor,
    pub committer: GitActor,
    #[serde(default)]
    pub message: String,
    /// `owner/name` of the repository this commit belongs to.
    #[serde(rename = "_sdc_repository")]
    pub repository: String,
}

impl CommitRecord {
    /// Replication-key value: the committer date, which is what moves when
    /// history is rewritten or cherry-picked.
    pub fn replication_key(&self) -> &str {
        &self.committer.date
    }
}

/// Kind of change a commit made to one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Delete,
    Edit,
    /// No content change (e.g. a pure rename or mode change).
    #[default]
    None,
}

/// File-level change belonging to one commit. Produced identically by the
/// remote-API path and the local diff-parser path so either source is
/// interchangeable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Synthetic key `repo/sha/filename`, filled at emission time.
    #[serde(default)]
    pub id: String,
    pub filename: String,
    /// Previous name when the change includes a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_filename: Option<String>,
    pub additions: u64,
    pub deletions: u64,
    #[serde(rename = "changetype")]
    pub change_type: ChangeType,
    pub is_binary: bool,
    pub is_large_patch: bool,
    /// Hunk headers and body lines, joined with newlines. Absent for binary
    /// files and for patches over the large-patch threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// Sha of the owning commit.
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default, rename = "_sdc_repository")]
    pub repository: String,
}

impl FileChange {
    /// A fresh change record for `filename` with nothing counted yet.
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    /// Attaches commit and repository identity and derives the synthetic id.
    pub fn attach(mut self, repo: &RepoId, commit_sha: &str) -> Self {
        self.commit_sha = commit_sha.to_string();
        self.repository = repo.path();
        self.id = format!("{}/{}/{}", self.repository, self.commit_sha, self.filename);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_id_parse() {
        let repo: RepoId = "acme/widgets".parse().unwrap();
        assert_eq!(repo.owner(), "acme");
        assert_eq!(repo.name(), "widgets");
        assert_eq!(repo.to_string(), "acme/widgets");
    }

    #[test]
    fn test_repo_id_rejects_malformed() {
        assert!("acme".parse::<RepoId>().is_err());
        assert!("/widgets".parse::<RepoId>().is_err());
        assert!("acme/".parse::<RepoId>().is_err());
        assert!("a/b/c".parse::<RepoId>().is_err());
    }

    #[test]
    fn test_file_change_attach() {
        let repo = RepoId::new("acme", "widgets");
        let change = FileChange::new("src/main.rs").attach(&repo, "abc123");
        assert_eq!(change.id, "acme/widgets/abc123/src/main.rs");
        assert_eq!(change.commit_sha, "abc123");
        assert_eq!(change.repository, "acme/widgets");
    }

    #[test]
    fn test_change_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChangeType::Edit).unwrap(),
            "\"edit\""
        );
        assert_eq!(
            serde_json::to_string(&ChangeType::None).unwrap(),
            "\"none\""
        );
    }
}
