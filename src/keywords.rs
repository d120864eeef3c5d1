//! Keyword Store: read side of the keyword graph.
//!
//! Writes happen only inside the indexing commit (see
//! [`Store::commit_indexing`]), which replaces a reference's associations
//! in full. This service normalizes caller-supplied filters and exposes
//! the listing, intersection and aggregation queries.

use std::sync::Arc;

use indexmap::IndexMap;

use refindex_core::keywords::normalize_filter;
use refindex_core::store::Store;

use crate::error::Result;

#[derive(Clone)]
pub struct KeywordStore {
    store: Arc<dyn Store>,
}

impl KeywordStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Every keyword ever stored, sorted. Orphaned keywords are included.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.store.list_keywords().await?)
    }

    pub async fn keywords_for(&self, reference_id: &str) -> Result<Vec<String>> {
        Ok(self.store.keywords_for(reference_id).await?)
    }

    /// Ids of references carrying every one of `keywords`.
    ///
    /// Input is normalized and deduplicated first. An empty filter matches
    /// nothing.
    pub async fn reference_ids_matching_all<S: AsRef<str>>(
        &self,
        keywords: &[S],
    ) -> Result<Vec<String>> {
        let keywords = normalize_filter(keywords);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.reference_ids_matching_all(&keywords).await?)
    }

    /// Keyword to distinct-reference count, highest count first (ties by
    /// keyword).
    ///
    /// With a non-empty `selected`, only references carrying all of
    /// `selected` are counted; if there are none the map is empty.
    pub async fn counts_by_keyword<S: AsRef<str>>(
        &self,
        selected: &[S],
    ) -> Result<IndexMap<String, i64>> {
        let selected = normalize_filter(selected);
        if !selected.is_empty()
            && self
                .store
                .reference_ids_matching_all(&selected)
                .await?
                .is_empty()
        {
            return Ok(IndexMap::new());
        }
        let counts = self.store.keyword_counts(&selected).await?;
        Ok(counts.into_iter().collect())
    }
}
