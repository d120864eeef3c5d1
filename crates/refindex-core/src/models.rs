//! Core data models used throughout refindex.
//!
//! These types describe references as they move through their lifecycle
//! (`pending` → `indexed` / `failed`), the passages derived from them by the
//! extraction pipeline, and the outcomes storage backends report back.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::content_hash;

/// Kind of content source a reference was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Url,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Url => "url",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "url" => Ok(ReferenceKind::Url),
            other => bail!("unknown reference type: '{}'", other),
        }
    }
}

/// Persisted indexing status of a reference.
///
/// `Indexing` is not a stored state: an in-flight run is observable only
/// as `Pending` plus a job held by the indexing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Pending,
    Indexed,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexed => "indexed",
            IndexStatus::Failed => "failed",
        }
    }
}

impl FromStr for IndexStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(IndexStatus::Pending),
            "indexed" => Ok(IndexStatus::Indexed),
            "failed" => Ok(IndexStatus::Failed),
            other => bail!("unknown index status: '{}'", other),
        }
    }
}

/// A persisted reference, as returned to callers.
///
/// `contents` is only populated when explicitly requested, and `keywords`
/// only when the caller asked for them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reference {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub source: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    pub indexed: bool,
    pub status: IndexStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

/// A reference about to be inserted.
#[derive(Debug, Clone)]
pub struct NewReference {
    pub id: String,
    pub kind: ReferenceKind,
    pub source: String,
    pub contents: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl NewReference {
    /// Build an unindexed reference with a fresh UUID and the hash of its contents.
    pub fn new(kind: ReferenceKind, source: &str, contents: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source: source.to_string(),
            content_hash: content_hash(&contents),
            contents,
            created_at: Utc::now(),
        }
    }
}

/// Result of a conflict-aware reference insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(Reference),
    /// A reference with the same `(type, source)` already existed.
    Existing(Reference),
}

impl InsertOutcome {
    pub fn into_reference(self) -> Reference {
        match self {
            InsertOutcome::Created(r) | InsertOutcome::Existing(r) => r,
        }
    }
}

/// A contiguous passage of a document produced by segmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    pub index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A passage enriched by the extraction pipeline (a derived node).
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedPassage {
    pub index: i64,
    pub text: String,
    pub summary: Option<String>,
    /// Raw keyword excerpt, e.g. `"Keywords: a, b, c"`.
    pub keywords_excerpt: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

/// Everything one successful indexing run commits for a reference.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub reference_id: String,
    /// Hash of the contents the run was computed from.
    pub content_hash: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub keywords: BTreeSet<String>,
    pub passages: Vec<DerivedPassage>,
}

/// What happened when an indexing run tried to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The reference's contents changed while the run was in flight.
    Superseded,
    /// The reference was deleted while the run was in flight.
    Missing,
}
