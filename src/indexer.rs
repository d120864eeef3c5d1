//! The background indexing job.
//!
//! Loads a reference, runs the extraction pipeline over its contents and
//! commits the result in one transaction. Failures stay here: they are
//! logged and recorded on the row as `status = failed`, never returned to
//! the caller that triggered the run.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use refindex_core::fingerprint::content_hash;
use refindex_core::models::CommitOutcome;
use refindex_core::store::Store;

use crate::pipeline::ExtractionPipeline;
use crate::queue::IndexJob;

pub struct Indexer {
    store: Arc<dyn Store>,
    pipeline: ExtractionPipeline,
}

impl Indexer {
    pub fn new(store: Arc<dyn Store>, pipeline: ExtractionPipeline) -> Self {
        Self { store, pipeline }
    }

    async fn run(&self, reference_id: &str) -> Result<()> {
        let Some(contents) = self.load_contents(reference_id).await? else {
            tracing::debug!(reference_id, "reference gone before indexing started");
            return Ok(());
        };
        let hash = content_hash(&contents);

        let doc = match self.pipeline.run(reference_id, &hash, &contents).await {
            Ok(doc) => doc,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(reference_id, error = %message, "indexing failed");
                self.store.mark_failed(reference_id, &hash, &message).await?;
                return Ok(());
            }
        };

        match self.store.commit_indexing(&doc).await? {
            CommitOutcome::Committed => tracing::info!(
                reference_id,
                keywords = doc.keywords.len(),
                passages = doc.passages.len(),
                "indexed"
            ),
            CommitOutcome::Superseded => {
                tracing::debug!(reference_id, "contents changed during indexing; commit skipped")
            }
            CommitOutcome::Missing => {
                tracing::debug!(reference_id, "reference deleted during indexing")
            }
        }
        Ok(())
    }

    async fn load_contents(&self, reference_id: &str) -> Result<Option<String>> {
        let found = self
            .store
            .get_references(&[reference_id.to_string()], true)
            .await?;
        Ok(found
            .into_iter()
            .next()
            .map(|r| r.contents.unwrap_or_default()))
    }
}

#[async_trait]
impl IndexJob for Indexer {
    async fn index(&self, reference_id: &str) {
        if let Err(e) = self.run(reference_id).await {
            tracing::error!(reference_id, error = %format!("{:#}", e), "indexing storage error");
        }
    }

    async fn aborted(&self, reference_id: &str, reason: &str) {
        let recorded = match self.load_contents(reference_id).await {
            Ok(Some(contents)) => {
                self.store
                    .mark_failed(reference_id, &content_hash(&contents), reason)
                    .await
            }
            Ok(None) => return,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            tracing::error!(reference_id, error = %format!("{:#}", e), "could not record aborted run");
        }
    }
}
