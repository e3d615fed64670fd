//! Gitstream connector binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gitstream_connector::client::GithubClient;
use gitstream_connector::SyncRunner;
use gitstream_core::{Catalog, ConnectorConfig, JsonLinesEmitter, StateStore};
use gitstream_git::{MirrorConfig, MirrorSet};

/// Resolves a path from an environment variable or a positional argument.
fn path_from(env_key: &str, args: &[String], index: usize) -> Option<PathBuf> {
    std::env::var(env_key)
        .ok()
        .map(PathBuf::from)
        .or_else(|| args.get(index).map(PathBuf::from))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Records go to stdout; logging stays on stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = path_from("GITSTREAM_CONFIG", &args, 0)
        .context("pass a config path as the first argument or set GITSTREAM_CONFIG")?;
    let state_path = path_from("GITSTREAM_STATE", &args, 1);
    let catalog_path = path_from("GITSTREAM_CATALOG", &args, 2);

    let config = ConnectorConfig::load(&config_path)
        .with_context(|| format!("loading config from {config_path:?}"))?;

    tracing::info!("Starting Gitstream v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Repositories: {}", config.repository);
    tracing::info!("Working dir: {:?}", config.working_dir);

    let catalog = match &catalog_path {
        Some(path) => Some(Catalog::load(path).with_context(|| format!("loading catalog {path:?}"))?),
        None => None,
    };

    let state_store = match &state_path {
        Some(path) => StateStore::new(path),
        None => StateStore::ephemeral(),
    };

    let client = Arc::new(GithubClient::new(&config).context("building API client")?);
    let mirrors = Arc::new(MirrorSet::new(MirrorConfig::new(
        config.working_dir.clone(),
        config.access_token.clone(),
        config.git_base_url.clone(),
    )));
    let emitter = Arc::new(JsonLinesEmitter::stdout());

    let runner = SyncRunner::new(config, client, emitter, mirrors, state_store);
    runner.run(catalog).await.context("sync failed")?;

    tracing::info!("Sync completed");
    Ok(())
}
