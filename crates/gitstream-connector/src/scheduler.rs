//! Sync scheduler: drives repositories one at a time and their streams in a
//! stable order, resumes interrupted runs, and persists state only at safe
//! boundaries.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use gitstream_core::stream::StreamDescriptor;
use gitstream_core::{
    Catalog, ConnectorConfig, Emitter, RepoId, Selection, StateStore, SyncError, SyncState,
};
use gitstream_git::MirrorSet;

use crate::changes::{
    ChangeSource, LOCAL_DIFF_CONCURRENCY, LocalChanges, REMOTE_DIFF_CONCURRENCY, RemoteChanges,
    compute_changes,
};
use crate::client::GithubClient;
use crate::engines::{EngineCtx, sync_ascending, sync_descending, sync_full_table};
use crate::heads::{BranchHead, RunContext, pull_from_api};
use crate::registry::Registry;
use crate::walker::{GraphWalk, MirrorFirstPicker, RemoteOnlyPicker, SourcePicker};

/// Runs one full sync across the configured repositories.
pub struct SyncRunner {
    config: ConnectorConfig,
    client: Arc<GithubClient>,
    emitter: Arc<dyn Emitter>,
    mirrors: Arc<MirrorSet>,
    state_store: StateStore,
    registry: Registry,
}

impl SyncRunner {
    pub fn new(
        config: ConnectorConfig,
        client: Arc<GithubClient>,
        emitter: Arc<dyn Emitter>,
        mirrors: Arc<MirrorSet>,
        state_store: StateStore,
    ) -> Self {
        Self {
            config,
            client,
            emitter,
            mirrors,
            state_store,
            registry: Registry::new(),
        }
    }

    /// Syncs every selected stream of every configured repository.
    pub async fn run(&self, catalog: Option<Catalog>) -> Result<(), SyncError> {
        let selection = match &catalog {
            Some(catalog) => Selection::from_catalog(catalog),
            None => Selection::all(&self.registry.known_ids()),
        };

        let repos = self
            .client
            .expand_repositories(&self.config.repo_specs()?)
            .await?;
        let repo_paths: Vec<String> = repos.iter().map(RepoId::path).collect();

        let mut state = self
            .state_store
            .load(&self.registry.known_ids(), &repo_paths)?;

        let mut streams: Vec<&StreamDescriptor> = self
            .registry
            .parentless_in_order()
            .into_iter()
            .filter(|desc| self.registry.is_needed(desc.id, &selection))
            .collect();
        info!(
            streams = ?streams.iter().map(|s| s.id).collect::<Vec<_>>(),
            "streams to sync"
        );

        // Resume an interrupted run: the interrupted stream/repository goes
        // first, the rest keep their relative order.
        let mut repos = repos;
        if let Some(current) = state.currently_syncing_repo.clone() {
            rotate_to_front(&mut repos, |repo| repo.path() == current);
        }
        if let Some(current) = state.currently_syncing_stream.clone() {
            rotate_to_front(&mut streams, |desc| desc.id == current);
        }

        let run_ctx = RunContext::new();
        self.checkpoint(&state)?;

        for repo in &repos {
            info!(repo = %repo, "starting sync of repository");
            state.currently_syncing_repo = Some(repo.path());

            for desc in &streams {
                state.currently_syncing_stream = Some(desc.id.to_string());
                self.checkpoint(&state)?;
                self.write_schemas(desc, &selection)?;

                info!(stream = desc.id, repo = %repo, "syncing stream");
                match self
                    .sync_stream(&run_ctx, desc, repo, &mut state, &selection)
                    .await
                {
                    Ok(()) => {},
                    Err(err) if desc.discretionary && err.is_skippable_for_stream() => {
                        warn!(
                            stream = desc.id,
                            repo = %repo,
                            "skipping discretionary stream: {err}"
                        );
                    },
                    Err(err) => return Err(err),
                }
                self.checkpoint(&state)?;
            }

            state.currently_syncing_stream = None;
            state.currently_syncing_repo = None;
            self.checkpoint(&state)?;
        }

        Ok(())
    }

    async fn sync_stream(
        &self,
        run_ctx: &RunContext,
        desc: &StreamDescriptor,
        repo: &RepoId,
        state: &mut SyncState,
        selection: &Selection,
    ) -> Result<(), SyncError> {
        let ctx = EngineCtx {
            client: &self.client,
            emitter: self.emitter.as_ref(),
            registry: &self.registry,
            selection,
            start_date: self.config.start_date.as_deref(),
        };

        match desc.id {
            "branches" => self.sync_branches(&ctx, run_ctx, desc, repo).await,
            "pull_requests" => self.sync_pull_requests(&ctx, run_ctx, desc, repo, state).await,
            "commits" => self.sync_commits(&ctx, run_ctx, desc, repo, state).await,
            "commit_files" => self.sync_commit_files(&ctx, run_ctx, desc, repo, state).await,
            _ => match desc.source_order {
                gitstream_core::stream::SourceOrder::Descending => {
                    sync_descending(&ctx, desc, repo, state, None).await
                },
                gitstream_core::stream::SourceOrder::Ascending => {
                    sync_ascending(&ctx, desc, repo, state, None).await
                },
                gitstream_core::stream::SourceOrder::None => {
                    match desc.replication {
                        gitstream_core::stream::ReplicationMethod::FullTable => {
                            sync_full_table(&ctx, desc, repo, None).await
                        },
                        // Unordered incremental uses the ascending rules.
                        gitstream_core::stream::ReplicationMethod::Incremental => {
                            sync_ascending(&ctx, desc, repo, state, None).await
                        },
                    }
                },
            },
        }
    }

    /// Branches: full table, and it feeds the head cache the walker uses.
    async fn sync_branches(
        &self,
        ctx: &EngineCtx<'_>,
        run_ctx: &RunContext,
        desc: &StreamDescriptor,
        repo: &RepoId,
    ) -> Result<(), SyncError> {
        let meta = run_ctx.repo_meta(&self.client, repo).await?;
        let default_branch = meta.default_branch;
        let repo_hook = repo.clone();

        let hook = move |record: &mut Value| {
            let name = record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let sha = record
                .pointer("/commit/sha")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_default = name == default_branch;
            if let Some(obj) = record.as_object_mut() {
                obj.insert(
                    "repo_name".to_string(),
                    Value::String(format!("{}:{name}", repo_hook.path())),
                );
                obj.insert("isdefault".to_string(), Value::Bool(is_default));
            }
            if !sha.is_empty() {
                run_ctx.record_branch(&repo_hook, BranchHead { name, sha, is_default });
            }
        };
        sync_full_table(ctx, desc, repo, Some(&hook)).await
    }

    /// Pull requests: descending incremental, and each record feeds the PR
    /// head cache.
    async fn sync_pull_requests(
        &self,
        ctx: &EngineCtx<'_>,
        run_ctx: &RunContext,
        desc: &StreamDescriptor,
        repo: &RepoId,
        state: &mut SyncState,
    ) -> Result<(), SyncError> {
        let repo_hook = repo.clone();
        let hook = move |record: &mut Value| {
            if let Ok(pr) = pull_from_api(record) {
                run_ctx.record_pull(&repo_hook, pr);
            }
        };
        sync_descending(ctx, desc, repo, state, Some(&hook)).await
    }

    /// Commits: walker-driven over the remote listing only.
    async fn sync_commits(
        &self,
        ctx: &EngineCtx<'_>,
        run_ctx: &RunContext,
        desc: &StreamDescriptor,
        repo: &RepoId,
        state: &mut SyncState,
    ) -> Result<(), SyncError> {
        let picker: Arc<dyn SourcePicker> = Arc::new(RemoteOnlyPicker::new(Arc::clone(&self.client)));
        self.walk_and_emit(ctx, run_ctx, desc, repo, state, picker, |_, commits| {
            commits
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Payload(e.to_string()))
        })
        .await
    }

    /// Commit files: walker-driven, diffs computed locally when the mirror
    /// has the head and remotely otherwise.
    async fn sync_commit_files(
        &self,
        ctx: &EngineCtx<'_>,
        run_ctx: &RunContext,
        desc: &StreamDescriptor,
        repo: &RepoId,
        state: &mut SyncState,
    ) -> Result<(), SyncError> {
        let mirror = self.mirrors.mirror(repo);
        let picker: Arc<dyn SourcePicker> = Arc::new(MirrorFirstPicker::new(
            Arc::clone(&mirror),
            Arc::clone(&self.client),
        ));

        let repo_path = repo.path();
        let bookmark = state.bookmark(desc.id, &repo_path).cloned().unwrap_or_default();
        let fetched = bookmark.fetched_commits.clone();
        let since = if fetched.is_empty() {
            bookmark
                .since
                .clone()
                .or_else(|| self.config.start_date.clone())
        } else {
            // Push-after-commit timing makes the time bookmark unsafe once
            // we have a fetched set to rely on.
            None
        };

        let heads = run_ctx.heads_for_commits(&self.client, repo).await?;
        let mut walk = GraphWalk::new(repo.clone(), heads, fetched, since, picker);
        let mut extracted_at = Utc::now();

        while let Some(batch) = walk.next_batch().await? {
            extracted_at = Utc::now();
            let (source, concurrency): (Arc<dyn ChangeSource>, usize) = if batch.local {
                (
                    Arc::new(LocalChanges::new(Arc::clone(&mirror))),
                    LOCAL_DIFF_CONCURRENCY,
                )
            } else {
                (
                    Arc::new(RemoteChanges::new(Arc::clone(&self.client))),
                    REMOTE_DIFF_CONCURRENCY,
                )
            };
            info!(
                repo = %repo,
                commits = batch.commits.len(),
                local = batch.local,
                "computing file changes"
            );
            let results = compute_changes(source, repo, &batch.commits, concurrency).await?;
            for changes in results {
                for change in changes {
                    let value = serde_json::to_value(&change)
                        .map_err(|e| SyncError::Payload(e.to_string()))?;
                    ctx.emitter.record(desc.id, &value, extracted_at)?;
                }
            }
        }

        // Persist only now: a crash mid-walk must force a safe re-walk, not
        // leave commits marked fetched whose parents never arrived.
        let bookmark = state.bookmark_mut(desc.id, &repo_path);
        bookmark.since = Some(extracted_at.to_rfc3339_opts(SecondsFormat::Micros, true));
        bookmark.fetched_commits = walk.into_fetched();
        Ok(())
    }

    /// Shared walker loop for the commit streams: emit every new commit once,
    /// then persist the grown fetched-set.
    async fn walk_and_emit<F>(
        &self,
        ctx: &EngineCtx<'_>,
        run_ctx: &RunContext,
        desc: &StreamDescriptor,
        repo: &RepoId,
        state: &mut SyncState,
        picker: Arc<dyn SourcePicker>,
        to_values: F,
    ) -> Result<(), SyncError>
    where
        F: Fn(&RepoId, &[gitstream_core::CommitRecord]) -> Result<Vec<Value>, SyncError>,
    {
        let repo_path = repo.path();
        let bookmark = state.bookmark(desc.id, &repo_path).cloned().unwrap_or_default();
        let fetched = bookmark.fetched_commits.clone();
        let since = if fetched.is_empty() {
            bookmark
                .since
                .clone()
                .or_else(|| self.config.start_date.clone())
        } else {
            None
        };

        let heads = run_ctx.heads_for_commits(&self.client, repo).await?;
        let mut walk = GraphWalk::new(repo.clone(), heads, fetched, since, picker);
        let mut extracted_at = Utc::now();

        while let Some(batch) = walk.next_batch().await? {
            extracted_at = Utc::now();
            for value in to_values(repo, &batch.commits)? {
                ctx.emitter.record(desc.id, &value, extracted_at)?;
            }
        }

        let bookmark = state.bookmark_mut(desc.id, &repo_path);
        bookmark.since = Some(extracted_at.to_rfc3339_opts(SecondsFormat::Micros, true));
        bookmark.fetched_commits = walk.into_fetched();
        Ok(())
    }

    /// Emits SCHEMA messages for a stream and its selected descendants.
    fn write_schemas(&self, desc: &StreamDescriptor, selection: &Selection) -> Result<(), SyncError> {
        if selection.is_selected(desc.id) {
            self.emitter
                .schema(desc.id, &build_schema(desc), desc.key_fields)?;
        }
        for child_id in desc.children {
            if let Some(child) = self.registry.get(child_id) {
                self.write_schemas(child, selection)?;
            }
        }
        Ok(())
    }

    /// Emits a STATE snapshot and persists the state file.
    fn checkpoint(&self, state: &SyncState) -> Result<(), SyncError> {
        self.emitter.state(state)?;
        self.state_store.save(state)
    }
}

/// Rotates `items` so the first match leads; relative order is preserved.
pub(crate) fn rotate_to_front<T>(items: &mut [T], matches: impl Fn(&T) -> bool) {
    if let Some(position) = items.iter().position(matches) {
        items.rotate_left(position);
    }
}

/// Minimal permissive schema; field-level discovery formatting lives in the
/// downstream pipeline.
fn build_schema(desc: &StreamDescriptor) -> Value {
    let mut properties = serde_json::Map::new();
    for key in desc.key_fields {
        properties.insert(key.to_string(), json!({"type": ["null", "string", "integer"]}));
    }
    if let Some(replication_key) = desc.replication_key {
        properties.insert(
            replication_key.to_string(),
            json!({"type": ["null", "string"], "format": "date-time"}),
        );
    }
    properties.insert(
        "_sdc_repository".to_string(),
        json!({"type": ["null", "string"]}),
    );
    json!({
        "type": ["null", "object"],
        "additionalProperties": true,
        "properties": properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_to_front() {
        let mut items = vec!["branches", "pull_requests", "commits", "issues"];
        rotate_to_front(&mut items, |s| *s == "commits");
        assert_eq!(items, vec!["commits", "issues", "branches", "pull_requests"]);

        // No match leaves the order untouched.
        let mut unchanged = vec!["a", "b"];
        rotate_to_front(&mut unchanged, |s| *s == "zzz");
        assert_eq!(unchanged, vec!["a", "b"]);
    }

    #[test]
    fn test_build_schema_carries_keys() {
        let registry = Registry::new();
        let desc = registry.get("commit_files").unwrap();
        let schema = build_schema(desc);
        assert_eq!(schema["type"][1], "object");
        assert!(schema["properties"]["id"].is_object());
        assert!(schema["properties"]["_sdc_repository"].is_object());

        let issues = registry.get("issues").unwrap();
        let schema = build_schema(issues);
        assert_eq!(schema["properties"]["updated_at"]["format"], "date-time");
    }
}
