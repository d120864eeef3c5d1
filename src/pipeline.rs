//! Extraction pipeline orchestration.
//!
//! Runs the fixed chain of steps over a reference's contents:
//!
//! 1. `segment`: split into passages
//! 2. `title`: over the leading passages
//! 3. `passage_summary`: per passage
//! 4. `keywords`: per passage, `"Keywords: a, b"` excerpts
//! 5. `embed`: per passage, skipped when no embedder is configured
//! 6. `document_summary`: over the whole document
//!
//! Every step goes through the transformation cache first. The
//! fingerprint covers the step name, its parameters (including the model
//! name) and the exact input text, so a hit is interchangeable with
//! recomputation. External calls run under a per-step timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use refindex_core::capability::{ExtractionStep, Extractor, StepParams};
use refindex_core::chunk::segment_text;
use refindex_core::embedding::Embedder;
use refindex_core::fingerprint::fingerprint;
use refindex_core::keywords::collect_keywords;
use refindex_core::models::{DerivedPassage, IndexedDocument};
use refindex_core::store::TransformCache;

use crate::config::Config;

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub segment_max_tokens: usize,
    pub title_max_tokens: usize,
    pub summary_max_tokens: usize,
    pub keywords_max_tokens: usize,
    pub keywords_per_passage: usize,
    pub title_passages: usize,
    pub step_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let ex = &config.extraction;
        Self {
            segment_max_tokens: config.segmentation.max_tokens,
            title_max_tokens: ex.title_max_tokens,
            summary_max_tokens: ex.summary_max_tokens,
            keywords_max_tokens: ex.keywords_max_tokens,
            keywords_per_passage: ex.keywords_per_passage,
            title_passages: ex.title_passages.max(1),
            step_timeout: Duration::from_secs(ex.step_timeout_secs),
        }
    }
}

pub struct ExtractionPipeline {
    cache: Arc<dyn TransformCache>,
    extractor: Arc<dyn Extractor>,
    embedder: Option<Arc<dyn Embedder>>,
    settings: PipelineSettings,
}

impl ExtractionPipeline {
    pub fn new(
        cache: Arc<dyn TransformCache>,
        extractor: Arc<dyn Extractor>,
        embedder: Option<Arc<dyn Embedder>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            cache,
            extractor,
            embedder,
            settings,
        }
    }

    /// Run every step over `contents` and assemble what the indexing
    /// commit needs. Nothing is persisted here except cache entries.
    pub async fn run(
        &self,
        reference_id: &str,
        content_hash: &str,
        contents: &str,
    ) -> Result<IndexedDocument> {
        let texts = self.segment(contents).await?;
        tracing::debug!(reference_id, passages = texts.len(), "segmented");

        let title = if texts.is_empty() {
            None
        } else {
            let lead = texts
                .iter()
                .take(self.settings.title_passages)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n\n");
            let params = StepParams::new(self.settings.title_max_tokens);
            non_empty(
                self.extract(
                    ExtractionStep::Title,
                    json!({
                        "model": self.extractor.model_name(),
                        "max_tokens": params.max_tokens,
                        "passages": self.settings.title_passages,
                    }),
                    &lead,
                    params,
                )
                .await?,
            )
        };

        let mut passages = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            let summary_params = StepParams::new(self.settings.summary_max_tokens);
            let summary = self
                .extract(
                    ExtractionStep::PassageSummary,
                    self.step_params_json(&summary_params),
                    text,
                    summary_params,
                )
                .await?;

            let keyword_params = StepParams::new(self.settings.keywords_max_tokens)
                .with_count(self.settings.keywords_per_passage);
            let excerpt = self
                .extract(
                    ExtractionStep::Keywords,
                    self.step_params_json(&keyword_params),
                    text,
                    keyword_params,
                )
                .await?;

            passages.push(DerivedPassage {
                index: index as i64,
                text: text.clone(),
                summary: non_empty(summary),
                keywords_excerpt: Some(excerpt),
                embedding: None,
            });
        }

        if let Some(embedder) = &self.embedder {
            let vectors = self.embed(embedder.as_ref(), &texts).await?;
            for (passage, vector) in passages.iter_mut().zip(vectors) {
                passage.embedding = Some(vector);
            }
        }

        let summary = if contents.trim().is_empty() {
            None
        } else {
            let params = StepParams::new(self.settings.summary_max_tokens);
            non_empty(
                self.extract(
                    ExtractionStep::DocumentSummary,
                    self.step_params_json(&params),
                    contents,
                    params,
                )
                .await?,
            )
        };

        let keywords = collect_keywords(
            passages
                .iter()
                .filter_map(|p| p.keywords_excerpt.as_deref()),
        );
        tracing::debug!(reference_id, keywords = keywords.len(), "extraction complete");

        Ok(IndexedDocument {
            reference_id: reference_id.to_string(),
            content_hash: content_hash.to_string(),
            title,
            summary,
            keywords,
            passages,
        })
    }

    async fn segment(&self, contents: &str) -> Result<Vec<String>> {
        let max_tokens = self.settings.segment_max_tokens;
        let raw = self
            .cached("segment", json!({ "max_tokens": max_tokens }), contents, move || async move {
                let texts: Vec<String> = segment_text(contents, max_tokens)
                    .into_iter()
                    .map(|p| p.text)
                    .collect();
                Ok(serde_json::to_string(&texts)?)
            })
            .await?;
        serde_json::from_str(&raw).context("corrupt cached segmentation")
    }

    fn step_params_json(&self, params: &StepParams) -> serde_json::Value {
        let mut value = json!(params);
        value["model"] = json!(self.extractor.model_name());
        value
    }

    async fn extract(
        &self,
        step: ExtractionStep,
        fp_params: serde_json::Value,
        input: &str,
        params: StepParams,
    ) -> Result<String> {
        let extractor = self.extractor.clone();
        self.cached(step.as_str(), fp_params, input, || async move {
            extractor.run(step, input, &params).await
        })
        .await
    }

    /// Embed passages, reusing cached vectors and sending only misses.
    async fn embed(&self, embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let params = json!({ "model": embedder.model_name(), "dims": embedder.dims() });
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let fp = fingerprint("embed", &params, text);
            match self.cache.get(&fp).await? {
                Some(hit) => vectors.push(Some(
                    serde_json::from_str(&hit).context("corrupt cached embedding")?,
                )),
                None => {
                    vectors.push(None);
                    misses.push((i, fp));
                }
            }
        }

        if !misses.is_empty() {
            let batch: Vec<String> = misses.iter().map(|(i, _)| texts[*i].clone()).collect();
            let computed = self
                .with_timeout("embed", embedder.embed(&batch))
                .await?;
            if computed.len() != batch.len() {
                return Err(anyhow!(
                    "embedder returned {} vectors for {} passages",
                    computed.len(),
                    batch.len()
                ));
            }
            for ((i, fp), vector) in misses.into_iter().zip(computed) {
                self.cache
                    .put(&fp, "embed", &serde_json::to_string(&vector)?)
                    .await?;
                vectors[i] = Some(vector);
            }
        }

        vectors
            .into_iter()
            .map(|v| v.ok_or_else(|| anyhow!("missing embedding")))
            .collect()
    }

    /// Look up `(step, params, input)` in the cache; on a miss, compute
    /// under the step timeout and store the result.
    async fn cached<F, Fut>(
        &self,
        step: &str,
        params: serde_json::Value,
        input: &str,
        compute: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let fp = fingerprint(step, &params, input);
        if let Some(hit) = self.cache.get(&fp).await? {
            tracing::trace!(step, "cache hit");
            return Ok(hit);
        }
        let output = self.with_timeout(step, compute()).await?;
        self.cache.put(&fp, step, &output).await?;
        Ok(output)
    }

    async fn with_timeout<T>(
        &self,
        step: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.settings.step_timeout, fut)
            .await
            .map_err(|_| {
                anyhow!(
                    "step '{}' timed out after {}s",
                    step,
                    self.settings.step_timeout.as_secs_f64()
                )
            })?
            .with_context(|| format!("step '{}' failed", step))
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
