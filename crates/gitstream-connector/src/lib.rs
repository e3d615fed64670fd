//! # Gitstream Connector
//!
//! The runnable surface of Gitstream: the rate-limited HTTP client, the
//! commit graph walker with its two interchangeable history/diff paths, the
//! generic incremental-stream engines, the stream registry and the sync
//! scheduler that drives repositories and streams in order.

pub mod changes;
pub mod client;
pub mod engines;
pub mod heads;
pub mod registry;
pub mod scheduler;
pub mod walker;

// Re-exports
pub use client::{GithubClient, Paginator, RequestOptions};
pub use heads::RunContext;
pub use registry::Registry;
pub use scheduler::SyncRunner;
pub use walker::{GraphWalk, WalkBatch};
