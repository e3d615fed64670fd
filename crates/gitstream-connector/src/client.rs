//! HTTP client with retry, rate limiting and status-code mapping.
//!
//! All API traffic of a run flows through one `GithubClient`, so the
//! rate-limit session state (remaining quota, reset time) is observed and
//! updated consistently by every caller against the account.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use gitstream_core::config::RepoSpec;
use gitstream_core::{ConnectorConfig, RepoId, SyncError};

/// Transport failures and 5xx responses retry this many times.
const MAX_ATTEMPTS: u32 = 5;

/// Seconds added past the advertised reset time before resuming.
const RATE_RESET_BUFFER_SECS: u64 = 10;

const RATE_REMAINING: &str = "x-ratelimit-remaining";
const RATE_RESET: &str = "x-ratelimit-reset";

/// Last-seen rate-limit headers for the account session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitSnapshot {
    pub remaining: Option<u64>,
    pub reset_epoch: Option<i64>,
}

/// Source of the API token. Static tokens cannot refresh; installation-based
/// credentials mint a fresh token when the current one expires.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> String;

    /// Attempts to mint a fresh token; `false` when unsupported.
    fn refresh(&self) -> bool;
}

/// A plain personal-access token.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> String {
        self.0.clone()
    }

    fn refresh(&self) -> bool {
        false
    }
}

/// Per-call behavior toggles.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Coerce a 404 into an empty result instead of an error.
    pub skip_not_found: bool,
    /// Coerce a 409 into an empty result (commit listing on an empty repo).
    pub empty_on_conflict: bool,
    /// Extra `Accept` header some endpoints require.
    pub accept: Option<&'static str>,
}

/// One page of an API response.
#[derive(Debug)]
pub struct ApiPage {
    pub body: Value,
    /// URL of the next page, from the `Link` header.
    pub next: Option<String>,
}

/// What to do with a non-2xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusOutcome {
    Credentials,
    Permission,
    /// Primary quota exhausted: sleep until reset, retry indefinitely.
    PrimaryRateLimit,
    /// Secondary/abuse limit: sleep exactly this many seconds, retry once.
    SecondaryRateLimit(u64),
    NotFound,
    Conflict,
    Gone,
    ServerError,
    Other,
}

/// Maps a non-2xx status to its handling, unmasking rate limits disguised as
/// 403 permission errors.
pub(crate) fn classify_status(
    status: u16,
    remaining: Option<u64>,
    retry_after: Option<u64>,
    body: &str,
) -> StatusOutcome {
    match status {
        401 => StatusOutcome::Credentials,
        403 => {
            if remaining == Some(0) {
                StatusOutcome::PrimaryRateLimit
            } else if retry_after.is_some() || body.to_ascii_lowercase().contains("rate limit") {
                StatusOutcome::SecondaryRateLimit(retry_after.unwrap_or(60))
            } else {
                StatusOutcome::Permission
            }
        },
        404 => StatusOutcome::NotFound,
        409 => StatusOutcome::Conflict,
        410 => StatusOutcome::Gone,
        429 => StatusOutcome::SecondaryRateLimit(retry_after.unwrap_or(60)),
        500..=599 => StatusOutcome::ServerError,
        _ => StatusOutcome::Other,
    }
}

/// Exponential backoff schedule: 1s, 2s, 4s, 8s between attempts.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.saturating_sub(1).min(6))
}

/// Extracts the `rel="next"` URL from a `Link` header.
pub(crate) fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut url = None;
        let mut is_next = false;
        for segment in part.split(';') {
            let segment = segment.trim();
            if segment.starts_with('<') && segment.ends_with('>') {
                url = Some(&segment[1..segment.len() - 1]);
            } else if let Some(rel) = segment.strip_prefix("rel=") {
                is_next = rel.trim_matches('"') == "next";
            }
        }
        if is_next {
            return url.map(str::to_string);
        }
    }
    None
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

/// The authenticated API client shared by a whole run.
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Box<dyn TokenSource>,
    rate: Arc<Mutex<RateLimitSnapshot>>,
    max_sleep: Duration,
}

impl GithubClient {
    /// Builds a client from the connector configuration.
    pub fn new(config: &ConnectorConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("gitstream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tokens: Box::new(StaticToken::new(config.access_token.clone())),
            rate: Arc::new(Mutex::new(RateLimitSnapshot::default())),
            max_sleep: Duration::from_secs(config.max_sleep_secs),
        })
    }

    /// Swaps in a refreshable token source (installation-based credentials).
    pub fn with_token_source(mut self, tokens: Box<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Absolute URL for a path under the API root.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Absolute URL for a path under `/repos/{owner}/{name}/`.
    pub fn repo_url(&self, repo: &RepoId, path: &str) -> String {
        format!("{}/repos/{}/{}", self.base_url, repo.path(), path)
    }

    /// The last-seen rate-limit headers.
    pub fn rate_limit(&self) -> RateLimitSnapshot {
        *self.rate.lock()
    }

    fn update_rate(&self, remaining: Option<u64>, reset_epoch: Option<i64>) {
        let mut rate = self.rate.lock();
        if remaining.is_some() {
            rate.remaining = remaining;
        }
        if reset_epoch.is_some() {
            rate.reset_epoch = reset_epoch;
        }
    }

    fn seconds_until_reset(&self, reset_epoch: Option<i64>) -> u64 {
        let now = Utc::now().timestamp();
        let wait = reset_epoch.unwrap_or(now).saturating_sub(now).max(0) as u64
            + RATE_RESET_BUFFER_SECS;
        wait.min(self.max_sleep.as_secs())
    }

    /// Issues one GET, retrying transient failures and obeying rate limits.
    /// `Ok(None)` means the response was coerced to an empty result
    /// (skippable 404, empty-repo 409, disabled feature 410).
    pub async fn get(
        &self,
        source: &str,
        url: &str,
        opts: &RequestOptions,
    ) -> Result<Option<ApiPage>, SyncError> {
        let mut attempts = 0u32;
        let mut secondary_retried = false;
        let mut token_refreshed = false;

        loop {
            let mut request = self
                .http
                .get(url)
                .header("authorization", format!("token {}", self.tokens.token()));
            if let Some(accept) = opts.accept {
                request = request.header("accept", accept);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(SyncError::Transient(err.to_string()));
                    }
                    let delay = backoff_delay(attempts);
                    warn!(source, "transport error, retrying in {delay:?}: {err}");
                    tokio::time::sleep(delay).await;
                    continue;
                },
            };

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let remaining = header_u64(&headers, RATE_REMAINING);
            let reset_epoch = header_i64(&headers, RATE_RESET);
            let retry_after = header_u64(&headers, "retry-after");
            self.update_rate(remaining, reset_epoch);

            if (200..300).contains(&status) {
                let next = headers
                    .get("link")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_next_link);
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Transient(format!("invalid JSON from {source}: {e}")))?;

                // Quota just ran dry; wait it out now so the next call works.
                if remaining == Some(0) {
                    let wait = self.seconds_until_reset(reset_epoch);
                    info!(source, "rate-limit quota exhausted, sleeping {wait}s until reset");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }

                return Ok(Some(ApiPage { body, next }));
            }

            let body = response.text().await.unwrap_or_default();
            match classify_status(status, remaining, retry_after, &body) {
                StatusOutcome::Credentials => {
                    if !token_refreshed && self.tokens.refresh() {
                        token_refreshed = true;
                        info!(source, "token expired, refreshed and retrying");
                        continue;
                    }
                    return Err(SyncError::credentials(body));
                },
                StatusOutcome::Permission => {
                    return Err(SyncError::permission(source, body));
                },
                StatusOutcome::PrimaryRateLimit => {
                    // Quota exhaustion is never terminal.
                    let wait = self.seconds_until_reset(reset_epoch);
                    info!(source, "rate limit exhausted, retrying after {wait}s");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                },
                StatusOutcome::SecondaryRateLimit(secs) => {
                    if secondary_retried {
                        return Err(SyncError::RateLimited {
                            retry_after_secs: secs,
                        });
                    }
                    secondary_retried = true;
                    info!(source, "secondary rate limit, sleeping exactly {secs}s");
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                },
                StatusOutcome::NotFound => {
                    if opts.skip_not_found {
                        warn!(source, url, "resource not found, continuing with empty result");
                        return Ok(None);
                    }
                    return Err(SyncError::not_found(url.to_string()));
                },
                StatusOutcome::Conflict => {
                    if opts.empty_on_conflict {
                        debug!(source, "conflict on listing, treating repository as empty");
                        return Ok(None);
                    }
                    return Err(SyncError::Api {
                        status,
                        url: url.to_string(),
                        body,
                    });
                },
                StatusOutcome::Gone => {
                    warn!(source, url, "feature disabled for this repository, skipping");
                    return Ok(None);
                },
                StatusOutcome::ServerError => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(SyncError::Server { status, body });
                    }
                    let delay = backoff_delay(attempts);
                    warn!(source, status, "server error, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                },
                StatusOutcome::Other => {
                    return Err(SyncError::Api {
                        status,
                        url: url.to_string(),
                        body,
                    });
                },
            }
        }
    }

    /// Explicit page iterator over a list endpoint.
    pub fn paginate(&self, source: impl Into<String>, url: impl Into<String>) -> Paginator<'_> {
        self.paginate_with(source, url, RequestOptions::default())
    }

    /// Page iterator with per-call options.
    pub fn paginate_with(
        &self,
        source: impl Into<String>,
        url: impl Into<String>,
        opts: RequestOptions,
    ) -> Paginator<'_> {
        Paginator {
            client: self,
            source: source.into(),
            next: Some(url.into()),
            opts,
        }
    }

    /// Confirms the token can list commits for a repository, with a friendly
    /// message when it cannot.
    pub async fn verify_repo_access(&self, repo: &RepoId) -> Result<(), SyncError> {
        info!(repo = %repo, "verifying repository access");
        let url = self.repo_url(repo, "commits?per_page=1");
        let opts = RequestOptions {
            empty_on_conflict: true,
            ..RequestOptions::default()
        };
        match self.get("verify_repo_access", &url, &opts).await {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound(_)) => Err(SyncError::not_found(format!(
                "please check the repository name {repo:?} or grant the token access to it"
            ))),
            Err(other) => Err(other),
        }
    }

    /// Expands the configured repository list, resolving `owner/*` wildcards
    /// through the org listing and verifying access to every repository.
    pub async fn expand_repositories(
        &self,
        specs: &[RepoSpec],
    ) -> Result<Vec<RepoId>, SyncError> {
        let mut repos = Vec::new();
        for spec in specs {
            match spec {
                RepoSpec::Repo(repo) => {
                    self.verify_repo_access(repo).await?;
                    repos.push(repo.clone());
                },
                RepoSpec::OrgWildcard(org) => {
                    let url = self.url(&format!(
                        "orgs/{org}/repos?per_page=100&sort=created&direction=desc"
                    ));
                    let mut pager = self.paginate("org_repos", url);
                    while let Some(page) = pager.next_page().await? {
                        for value in page {
                            let Some(full_name) = value.get("full_name").and_then(Value::as_str)
                            else {
                                return Err(SyncError::Payload(
                                    "organization repo listing without full_name".to_string(),
                                ));
                            };
                            let repo: RepoId = full_name.parse()?;
                            self.verify_repo_access(&repo).await?;
                            repos.push(repo);
                        }
                    }
                },
            }
        }
        Ok(repos)
    }
}

/// Explicit `next_page` iterator over paginated list endpoints.
pub struct Paginator<'a> {
    client: &'a GithubClient,
    source: String,
    next: Option<String>,
    opts: RequestOptions,
}

impl Paginator<'_> {
    /// Fetches the next page; `None` once exhausted (or coerced empty).
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, SyncError> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };
        let Some(page) = self.client.get(&self.source, &url, &self.opts).await? else {
            return Ok(None);
        };
        self.next = page.next;
        let items = match page.body {
            Value::Array(items) => items,
            // Single-object endpoints page too (commit detail beyond 300
            // files repeats the object with a different file listing).
            other => vec![other],
        };
        Ok(Some(items))
    }
}
