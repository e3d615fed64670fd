//! # Gitstream Core
//!
//! Domain types shared by every Gitstream crate: repository and commit
//! records, the stream-descriptor registry types, the bookmark/state store
//! with its legacy-layout migration, the emit protocol handed to the
//! downstream sink, and the connector configuration document.

pub mod config;
pub mod error;
pub mod record;
pub mod state;
pub mod stream;
pub mod types;

// Re-exports
pub use config::{ConnectorConfig, RepoSpec};
pub use error::SyncError;
pub use record::{Emitter, JsonLinesEmitter};
pub use state::{Bookmark, FetchMark, FetchedSet, StateStore, SyncState};
pub use stream::{Catalog, ReplicationMethod, Selection, SourceOrder, StreamDescriptor};
pub use types::{ChangeType, CommitRecord, FileChange, GitActor, Head, RepoId};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
