//! # Gitstream Git
//!
//! Local git access for Gitstream: one persistent mirror per repository,
//! cloned on first use and updated thereafter, plus a parser turning raw
//! `git diff` output into structured per-file change records.
//!
//! The mirror exists so that per-commit diff computation, the most expensive
//! stage of a sync, does not spend API quota. Everything it produces is
//! structurally identical to the remote-API path, so callers can fall back to
//! the network whenever an object is not available locally.

pub mod diff;
pub mod error;
pub mod mirror;

// Re-exports
pub use diff::{LARGE_PATCH_THRESHOLD, parse_diff};
pub use error::GitError;
pub use mirror::{MirrorConfig, MirrorSet, RepoMirror};
