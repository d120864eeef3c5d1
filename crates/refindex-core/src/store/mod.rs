//! Storage abstraction for refindex.
//!
//! The [`Store`] trait covers the relational side (references, keywords,
//! their associations, and the derived passages written alongside an
//! indexing commit). The [`TransformCache`] trait is the content-addressed
//! key/value cache consulted by the extraction pipeline.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    CommitOutcome, DerivedPassage, IndexedDocument, InsertOutcome, NewReference, Reference,
    ReferenceKind,
};

/// Abstract storage backend for references and keywords.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_reference`](Store::insert_reference) | Insert unless `(type, source)` exists |
/// | [`find_by_source`](Store::find_by_source) | Look up a reference by origin |
/// | [`get_references`](Store::get_references) | Fetch references by id |
/// | [`list_references`](Store::list_references) | List, optionally by keyword intersection |
/// | [`reset_for_indexing`](Store::reset_for_indexing) | Flip back to pending, optionally with new contents |
/// | [`commit_indexing`](Store::commit_indexing) | Atomically persist one indexing run |
/// | [`mark_failed`](Store::mark_failed) | Record a failed indexing run |
/// | [`delete_reference`](Store::delete_reference) | Delete a reference and everything derived from it |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new reference. If one with the same `(type, source)`
    /// already exists, return it instead of failing.
    async fn insert_reference(&self, new: &NewReference) -> Result<InsertOutcome>;

    /// Find the reference for a source, without contents.
    async fn find_by_source(&self, kind: ReferenceKind, source: &str) -> Result<Option<Reference>>;

    /// Fetch references by id. Missing ids are skipped. `keywords` is left `None`.
    async fn get_references(&self, ids: &[String], include_contents: bool) -> Result<Vec<Reference>>;

    /// List references newest first. A non-empty `keywords` slice keeps only
    /// references associated with every listed (already normalized) keyword.
    async fn list_references(
        &self,
        include_contents: bool,
        keywords: &[String],
    ) -> Result<Vec<Reference>>;

    /// Raw contents of a reference.
    async fn get_contents(&self, id: &str) -> Result<Option<String>>;

    /// Mark a reference pending again. When `contents` is given, also
    /// replace the stored contents (and their hash). Returns `false` if the
    /// reference does not exist.
    async fn reset_for_indexing(&self, id: &str, contents: Option<&str>) -> Result<bool>;

    /// Persist title, summary, keyword set and passages, and flip the
    /// reference to indexed, all in one transaction.
    ///
    /// The commit only applies while the stored content hash still equals
    /// `doc.content_hash`. Existing keyword associations and passages are
    /// replaced in full, never merged.
    async fn commit_indexing(&self, doc: &IndexedDocument) -> Result<CommitOutcome>;

    /// Record a failed run, unless the contents have since changed.
    async fn mark_failed(&self, id: &str, content_hash: &str, error: &str) -> Result<bool>;

    /// Delete a reference, its keyword associations and derived passages.
    /// Returns `false` if it did not exist.
    async fn delete_reference(&self, id: &str) -> Result<bool>;

    /// Every stored keyword, sorted.
    async fn list_keywords(&self) -> Result<Vec<String>>;

    /// Keywords associated with a reference, sorted.
    async fn keywords_for(&self, id: &str) -> Result<Vec<String>>;

    /// Ids of references associated with every keyword in `keywords`.
    ///
    /// A reference qualifies only when its count of distinct matching
    /// keywords equals `keywords.len()`. Callers pass a deduplicated set.
    async fn reference_ids_matching_all(&self, keywords: &[String]) -> Result<Vec<String>>;

    /// Per-keyword count of distinct references, ordered by count
    /// descending then keyword. With a non-empty `selected`, counts are
    /// taken only over references matching all of `selected`, and an empty
    /// result is returned when no reference does.
    async fn keyword_counts(&self, selected: &[String]) -> Result<Vec<(String, i64)>>;

    /// Derived passages committed by the last successful indexing run.
    async fn passages_for(&self, id: &str) -> Result<Vec<DerivedPassage>>;
}

/// Content-addressed cache of transformation step outputs.
///
/// Entries are immutable: `put` on an existing fingerprint keeps the
/// first value.
#[async_trait]
pub trait TransformCache: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<String>>;

    async fn put(&self, fingerprint: &str, step: &str, output: &str) -> Result<()>;
}
