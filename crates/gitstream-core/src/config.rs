//! Connector configuration document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::RepoId;

fn default_working_dir() -> PathBuf {
    std::env::temp_dir().join("gitstream")
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_sleep() -> u64 {
    600
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_git_base() -> String {
    "https://github.com".to_string()
}

/// One entry of the configured repository list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSpec {
    /// A single repository.
    Repo(RepoId),
    /// Every repository of an organization (`owner/*`).
    OrgWildcard(String),
}

/// The connector's configuration, loaded from one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// API token. Never logged.
    pub access_token: String,

    /// Space-separated `owner/name` list; `owner/*` selects all repositories
    /// of an organization.
    pub repository: String,

    /// Lower bound of the first incremental window, ISO-8601.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,

    /// Directory holding one git mirror per repository, reused across runs.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Longest the client will sleep waiting out a rate-limit window.
    #[serde(default = "default_max_sleep")]
    pub max_sleep_secs: u64,

    #[serde(default = "default_api_base")]
    pub api_base_url: String,

    /// Host used for mirror clone URLs.
    #[serde(default = "default_git_base")]
    pub git_base_url: String,
}

impl ConnectorConfig {
    /// Loads the configuration document from disk.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::config(format!("unparseable config {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.access_token.trim().is_empty() {
            return Err(SyncError::config("access_token must not be empty"));
        }
        if self.repo_specs()?.is_empty() {
            return Err(SyncError::config("repository list must not be empty"));
        }
        Ok(())
    }

    /// Parses the repository list into concrete repos and org wildcards.
    pub fn repo_specs(&self) -> Result<Vec<RepoSpec>, SyncError> {
        let mut specs = Vec::new();
        for token in self.repository.split_whitespace() {
            match token.strip_suffix("/*") {
                Some(org) if !org.is_empty() && !org.contains('/') => {
                    specs.push(RepoSpec::OrgWildcard(org.to_string()));
                },
                Some(_) => {
                    return Err(SyncError::config(format!("malformed wildcard {token:?}")));
                },
                None => specs.push(RepoSpec::Repo(token.parse()?)),
            }
        }
        Ok(specs)
    }
}
