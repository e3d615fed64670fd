//! Stream descriptors and catalog selection.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// How a stream replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    Incremental,
    FullTable,
}

/// Order in which the source endpoint returns records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrder {
    Ascending,
    Descending,
    None,
}

/// Declarative metadata for one stream.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Stream id, also the state key.
    pub id: &'static str,
    pub replication: ReplicationMethod,
    /// Primary-key fields of the emitted records.
    pub key_fields: &'static [&'static str],
    /// Record field used as the bookmark watermark.
    pub replication_key: Option<&'static str>,
    pub source_order: SourceOrder,
    /// URL path template. Relative paths are rooted at `/repos/{owner}/{name}/`;
    /// org-scoped paths start at the API root. `{field}` placeholders resolve
    /// against the parent record.
    pub path: &'static str,
    /// Whether the endpoint accepts a `since` query parameter.
    pub filter_param: bool,
    /// Extra `Accept` header the endpoint requires, if any.
    pub accept: Option<&'static str>,
    /// Parent stream id for child streams synced per parent record.
    pub parent: Option<&'static str>,
    /// Child stream ids.
    pub children: &'static [&'static str],
    /// Rooted at the API root rather than under `/repos/{repo}/`.
    pub org_scoped: bool,
    /// Permission-gated: failures log and skip instead of aborting the run.
    pub discretionary: bool,
    /// Scheduling order. Ref-producing streams sort before commit-dependent
    /// ones; ties break on id.
    pub sort_hint: u8,
}

impl StreamDescriptor {
    /// A descriptor with everything defaulted except identity and path; the
    /// registry overrides the rest with struct-update syntax.
    pub const fn new(id: &'static str, path: &'static str) -> Self {
        Self {
            id,
            replication: ReplicationMethod::FullTable,
            key_fields: &["id"],
            replication_key: None,
            source_order: SourceOrder::None,
            path,
            filter_param: false,
            accept: None,
            parent: None,
            children: &[],
            org_scoped: false,
            discretionary: false,
            sort_hint: 5,
        }
    }
}

/// One entry of the user-supplied catalog document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub stream: String,
    #[serde(default)]
    pub selected: bool,
    /// Optional field projection; absent means all fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// The user-supplied catalog: which streams (and fields) to replicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub streams: Vec<CatalogEntry>,
}

impl Catalog {
    /// Loads a catalog document from disk.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| SyncError::config(format!("unparseable catalog {path:?}: {e}")))
    }
}

/// Resolved stream/field selection for one run.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    selected: BTreeSet<String>,
    fields: BTreeMap<String, Vec<String>>,
}

impl Selection {
    /// Selection from a catalog document.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut selection = Self::default();
        for entry in &catalog.streams {
            if entry.selected {
                selection.selected.insert(entry.stream.clone());
                if let Some(fields) = &entry.fields {
                    selection.fields.insert(entry.stream.clone(), fields.clone());
                }
            }
        }
        selection
    }

    /// Selects every listed stream with no field projection.
    pub fn all(ids: &[&str]) -> Self {
        Self {
            selected: ids.iter().map(|s| s.to_string()).collect(),
            fields: BTreeMap::new(),
        }
    }

    /// Whether a stream is selected for emission.
    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.contains(id)
    }

    /// The field projection for a stream, if the catalog narrowed it.
    pub fn fields(&self, id: &str) -> Option<&[String]> {
        self.fields.get(id).map(Vec::as_slice)
    }
}
