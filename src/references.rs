//! Reference Store: the reference lifecycle service.
//!
//! Coordinates the content fetcher, the storage backend and the indexing
//! queue. `add` and `reindex` return as soon as contents are persisted;
//! extraction happens on the queue's workers.
//!
//! # Lifecycle
//!
//! ```text
//! add ──► pending ──(queue)──► indexed
//!            ▲                   │
//!            │                   ▼
//!         reindex            failed (recorded, recoverable via reindex/add)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;

use refindex_core::capability::{ContentFetcher, Extractor};
use refindex_core::embedding::Embedder;
use refindex_core::keywords::normalize_filter;
use refindex_core::models::{IndexStatus, InsertOutcome, NewReference, Reference, ReferenceKind};
use refindex_core::store::{Store, TransformCache};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::error::{Error, Result};
use crate::extract::create_extractor;
use crate::fetch::HttpFetcher;
use crate::indexer::Indexer;
use crate::keywords::KeywordStore;
use crate::migrate::run_migrations;
use crate::pipeline::{ExtractionPipeline, PipelineSettings};
use crate::queue::IndexQueue;
use crate::sqlite_store::SqliteStore;

/// Everything a [`ReferenceStore`] is built from.
pub struct ReferenceStoreConfig {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn TransformCache>,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub pipeline: PipelineSettings,
    pub workers: usize,
}

impl ReferenceStoreConfig {
    /// Wire the SQLite backend and the providers selected in `config`.
    pub fn from_config(config: &Config, store: SqliteStore) -> anyhow::Result<Self> {
        let store = Arc::new(store);
        Ok(Self {
            store: store.clone(),
            cache: store,
            fetcher: Arc::new(HttpFetcher::new(&config.fetch)?),
            extractor: create_extractor(&config.extraction)
                .context("Failed to initialize extraction provider")?,
            embedder: create_embedder(&config.embedding)
                .context("Failed to initialize embedding provider")?,
            pipeline: PipelineSettings::from_config(config),
            workers: config.indexing.workers,
        })
    }
}

pub struct ReferenceStore {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn ContentFetcher>,
    keywords: KeywordStore,
    queue: IndexQueue,
    source_locks: SourceLocks,
}

impl ReferenceStore {
    /// Build the service and start its indexing workers.
    /// Must be called from within a tokio runtime.
    pub fn new(config: ReferenceStoreConfig) -> Self {
        let pipeline = ExtractionPipeline::new(
            config.cache,
            config.extractor,
            config.embedder,
            config.pipeline,
        );
        let indexer = Arc::new(Indexer::new(config.store.clone(), pipeline));
        Self {
            keywords: KeywordStore::new(config.store.clone()),
            queue: IndexQueue::start(indexer, config.workers),
            store: config.store,
            fetcher: config.fetcher,
            source_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open the configured database (creating and migrating it if needed)
    /// and build the service on top of it.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        run_migrations(&pool).await?;
        let parts = ReferenceStoreConfig::from_config(config, SqliteStore::new(pool))?;
        Ok(Self::new(parts))
    }

    pub fn keywords(&self) -> &KeywordStore {
        &self.keywords
    }

    /// Resolve once no indexing job is queued or running.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    /// Ingest a source.
    ///
    /// An existing reference for the same `(kind, source)` is returned
    /// as-is; if it is not indexed yet, indexing is scheduled again.
    /// Otherwise the source is fetched and a new pending reference is
    /// stored. Concurrent calls for one source fetch at most once.
    pub async fn add(&self, kind: &str, source: &str) -> Result<Reference> {
        let kind: ReferenceKind = kind
            .parse()
            .map_err(|_| Error::InvalidKind(kind.to_string()))?;
        let source = source.trim();
        let key = format!("{}:{}", kind, source);

        let slot = SourceSlot::acquire(&self.source_locks, key);
        let _guard = slot.lock.lock().await;
        self.add_locked(kind, source).await
    }

    async fn add_locked(&self, kind: ReferenceKind, source: &str) -> Result<Reference> {
        if let Some(existing) = self.store.find_by_source(kind, source).await? {
            return self.retry_if_unindexed(existing).await;
        }

        let contents = self.fetch(source).await?;
        let new = NewReference::new(kind, source, contents);
        match self.store.insert_reference(&new).await? {
            InsertOutcome::Created(reference) => {
                tracing::info!(reference_id = %reference.id, source, "reference added");
                self.queue.enqueue(&reference.id);
                Ok(reference)
            }
            // Another process inserted the same source first.
            InsertOutcome::Existing(existing) => self.retry_if_unindexed(existing).await,
        }
    }

    async fn retry_if_unindexed(&self, mut reference: Reference) -> Result<Reference> {
        if reference.indexed {
            return Ok(reference);
        }
        if reference.status == IndexStatus::Failed {
            self.store.reset_for_indexing(&reference.id, None).await?;
            reference.status = IndexStatus::Pending;
            reference.index_error = None;
        }
        tracing::debug!(reference_id = %reference.id, "existing reference not indexed; rescheduling");
        self.queue.enqueue(&reference.id);
        Ok(reference)
    }

    /// Re-fetch (for URLs) and re-index an existing reference.
    ///
    /// Returns the reference in its pending state. A failed re-fetch leaves
    /// the stored reference untouched.
    pub async fn reindex(&self, id: &str) -> Result<Reference> {
        let reference = self.require(id, false).await?;
        let contents = match reference.kind {
            ReferenceKind::Url => Some(self.fetch(&reference.source).await?),
        };

        if !self.store.reset_for_indexing(id, contents.as_deref()).await? {
            return Err(Error::NotFound { id: id.to_string() });
        }
        tracing::info!(reference_id = id, "reindex scheduled");
        self.queue.enqueue(id);
        self.require(id, false).await
    }

    pub async fn get(
        &self,
        id: &str,
        include_contents: bool,
        include_keywords: bool,
    ) -> Result<Option<Reference>> {
        let found = self
            .store
            .get_references(&[id.to_string()], include_contents)
            .await?;
        let Some(mut reference) = found.into_iter().next() else {
            return Ok(None);
        };
        if include_keywords {
            reference.keywords = Some(self.keywords.keywords_for(id).await?);
        }
        Ok(Some(reference))
    }

    /// Newest first. A non-empty `keywords` filter keeps only references
    /// carrying every listed keyword.
    pub async fn list<S: AsRef<str>>(
        &self,
        include_contents: bool,
        keywords: &[S],
    ) -> Result<Vec<Reference>> {
        let keywords = normalize_filter(keywords);
        Ok(self.store.list_references(include_contents, &keywords).await?)
    }

    pub async fn get_contents(&self, id: &str) -> Result<Option<String>> {
        Ok(self.store.get_contents(id).await?)
    }

    /// Delete a reference with its associations and derived passages.
    /// Deleting an unknown id is a no-op.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.store.delete_reference(id).await? {
            tracing::info!(reference_id = id, "reference deleted");
        } else {
            tracing::debug!(reference_id = id, "delete of unknown reference");
        }
        Ok(())
    }

    pub async fn keyword_counts<S: AsRef<str>>(
        &self,
        selected: &[S],
    ) -> Result<indexmap::IndexMap<String, i64>> {
        self.keywords.counts_by_keyword(selected).await
    }

    pub async fn keywords_for(&self, id: &str) -> Result<Vec<String>> {
        self.keywords.keywords_for(id).await
    }

    async fn require(&self, id: &str, include_contents: bool) -> Result<Reference> {
        self.get(id, include_contents, false)
            .await?
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    async fn fetch(&self, source: &str) -> Result<String> {
        self.fetcher.fetch(source).await.map_err(|cause| {
            tracing::warn!(source, error = %cause, "fetch failed");
            Error::Fetch {
                source_url: source.to_string(),
                cause,
            }
        })
    }
}

type SourceLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A caller's hold on the per-source add lock. The map entry is removed
/// when the last holder drops, including when an `add` future is
/// cancelled mid-fetch.
struct SourceSlot<'a> {
    locks: &'a SourceLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> SourceSlot<'a> {
    fn acquire(locks: &'a SourceLocks, key: String) -> Self {
        let lock = locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.clone())
            .or_default()
            .clone();
        Self { locks, key, lock }
    }
}

impl Drop for SourceSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Two owners left: the map and this slot.
        let last = locks
            .get(&self.key)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2);
        if last {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::LocalExtractor;
    use async_trait::async_trait;
    use refindex_core::store::memory::{InMemoryCache, InMemoryStore};

    struct StaticFetcher;

    #[async_trait]
    impl ContentFetcher for StaticFetcher {
        async fn fetch(&self, source: &str) -> anyhow::Result<String> {
            if source.contains("missing") {
                anyhow::bail!("HTTP 404 Not Found");
            }
            if source.contains("slow") {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
            Ok(format!("Page {}. Rust and tokio and sqlite.", source))
        }
    }

    fn service() -> ReferenceStore {
        let config = crate::config::parse_config("[db]\npath = \"x\"\n").unwrap();
        ReferenceStore::new(ReferenceStoreConfig {
            store: Arc::new(InMemoryStore::new()),
            cache: Arc::new(InMemoryCache::new()),
            fetcher: Arc::new(StaticFetcher),
            extractor: Arc::new(LocalExtractor),
            embedder: None,
            pipeline: PipelineSettings::from_config(&config),
            workers: 2,
        })
    }

    #[tokio::test]
    async fn test_invalid_kind_rejected() {
        let refs = service();
        let err = refs.add("pdf", "https://x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidKind(k) if k == "pdf"));
    }

    #[tokio::test]
    async fn test_add_then_index_in_memory() {
        let refs = service();
        let added = refs.add("url", " https://a ").await.unwrap();
        assert_eq!(added.source, "https://a");
        refs.wait_idle().await;

        let got = refs.get(&added.id, false, true).await.unwrap().unwrap();
        assert!(got.indexed);
        let keywords = got.keywords.unwrap();
        assert!(keywords.contains(&"rust".to_string()));
        assert!(keywords.contains(&"tokio".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_failure_creates_nothing() {
        let refs = service();
        let err = refs.add("url", "https://missing").await.unwrap_err();
        assert!(matches!(err, Error::Fetch { ref source_url, .. } if source_url == "https://missing"));
        assert!(refs.list::<&str>(false, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reindex_unknown_is_not_found() {
        let refs = service();
        let err = refs.reindex("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_source_locks_are_released() {
        let refs = service();
        refs.add("url", "https://a").await.unwrap();
        refs.add("url", "https://a").await.unwrap();
        assert!(refs.source_locks.lock().unwrap().is_empty());
        refs.wait_idle().await;
    }

    #[tokio::test]
    async fn test_cancelled_add_releases_source_lock() {
        let refs = service();
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            refs.add("url", "https://slow"),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(refs.source_locks.lock().unwrap().is_empty());
    }
}
