//! Capability traits consumed by the extraction pipeline.
//!
//! Fetching and extraction are external collaborators: the pipeline only
//! decides when they run and what gets cached. Implementations must be
//! `Send + Sync` so they can be shared by indexing workers.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Retrieves raw text for a source identifier (e.g. a URL).
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<String>;
}

/// One text-producing step of the extraction pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStep {
    /// A short document title from the leading passages.
    Title,
    /// A summary of a single passage.
    PassageSummary,
    /// A `"Keywords: a, b, c"` excerpt for a single passage.
    Keywords,
    /// A summary of the whole document.
    DocumentSummary,
}

impl ExtractionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStep::Title => "title",
            ExtractionStep::PassageSummary => "passage_summary",
            ExtractionStep::Keywords => "keywords",
            ExtractionStep::DocumentSummary => "document_summary",
        }
    }
}

/// Tunables passed to an extraction step. Part of the cache fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepParams {
    pub max_tokens: usize,
    /// Number of items requested (keyword steps only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl StepParams {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            count: None,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// Produces titles, summaries and keyword excerpts from text.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Identifier of the model or heuristic; part of the cache fingerprint.
    fn model_name(&self) -> &str;

    async fn run(&self, step: ExtractionStep, text: &str, params: &StepParams) -> Result<String>;
}
