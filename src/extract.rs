//! Extractor implementations: titles, summaries and keyword excerpts.
//!
//! - [`LocalExtractor`]: deterministic heuristics, no network. Used by
//!   default and in tests.
//! - [`OpenAiExtractor`]: chat completions against an OpenAI-compatible API.
//!
//! Both produce keyword excerpts in the `"Keywords: a, b, c"` shape that
//! [`refindex_core::keywords::parse_keyword_excerpt`] consumes.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;

use refindex_core::capability::{ExtractionStep, Extractor, StepParams};
use refindex_core::keywords::KEYWORDS_PREFIX;

use crate::config::ExtractionConfig;
use crate::openai::OpenAiClient;

/// Approximate characters per token, matching the segmenter.
const CHARS_PER_TOKEN: usize = 4;

/// Build the extractor selected by `extraction.provider`.
pub fn create_extractor(config: &ExtractionConfig) -> Result<Arc<dyn Extractor>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalExtractor)),
        "openai" => Ok(Arc::new(OpenAiExtractor::new(config)?)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

// ============ Local heuristics ============

pub struct LocalExtractor;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "before", "being", "between", "both", "but", "by", "can", "could", "did", "do",
    "does", "each", "for", "from", "had", "has", "have", "he", "her", "here", "him", "his", "how",
    "if", "in", "into", "is", "it", "its", "just", "like", "many", "may", "more", "most", "much",
    "must", "no", "not", "of", "on", "one", "only", "or", "other", "our", "out", "over", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "those", "through", "to", "too", "under", "up", "use", "used",
    "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "why", "will",
    "with", "would", "you", "your",
];

#[async_trait]
impl Extractor for LocalExtractor {
    fn model_name(&self) -> &str {
        "local-heuristic-v1"
    }

    async fn run(&self, step: ExtractionStep, text: &str, params: &StepParams) -> Result<String> {
        let budget = params.max_tokens * CHARS_PER_TOKEN;
        Ok(match step {
            ExtractionStep::Title => local_title(text, budget),
            ExtractionStep::PassageSummary | ExtractionStep::DocumentSummary => {
                leading_sentences(text, budget)
            }
            ExtractionStep::Keywords => {
                let words = top_words(text, params.count.unwrap_or(5));
                format_keywords(&words)
            }
        })
    }
}

fn local_title(text: &str, budget: usize) -> String {
    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let sentence = first_sentence(first_line);
    truncate_words(sentence.trim_end_matches(['.', ':', ';']), budget)
}

fn first_sentence(text: &str) -> &str {
    match text.find(". ") {
        Some(pos) => &text[..=pos],
        None => text,
    }
}

/// Whole sentences from the start of `text`, up to `budget` chars.
fn leading_sentences(text: &str, budget: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= budget {
        return flat;
    }
    let mut out = String::new();
    for sentence in flat.split_inclusive(". ") {
        if out.len() + sentence.len() > budget {
            break;
        }
        out.push_str(sentence);
    }
    if out.is_empty() {
        truncate_words(&flat, budget)
    } else {
        out.trim_end().to_string()
    }
}

fn truncate_words(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut out = String::new();
    for word in text.split_whitespace() {
        if !out.is_empty() && out.len() + 1 + word.len() > budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Most frequent non-stop-words, ties broken by first appearance.
fn top_words(text: &str, count: usize) -> Vec<String> {
    let mut freq: IndexMap<String, usize> = IndexMap::new();
    for raw in text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\'')) {
        let word = raw.trim_matches(|c: char| c == '-' || c == '\'').to_lowercase();
        if word.chars().count() < 3
            || word.chars().all(|c| c.is_numeric())
            || STOP_WORDS.contains(&word.as_str())
        {
            continue;
        }
        *freq.entry(word).or_insert(0) += 1;
    }
    // Stable sort keeps insertion order among equal counts.
    freq.sort_by(|_, a, _, b| b.cmp(a));
    freq.into_keys().take(count).collect()
}

fn format_keywords(words: &[String]) -> String {
    if words.is_empty() {
        KEYWORDS_PREFIX.to_string()
    } else {
        format!("{} {}", KEYWORDS_PREFIX, words.join(", "))
    }
}

// ============ OpenAI chat completions ============

pub struct OpenAiExtractor {
    client: OpenAiClient,
    model: String,
}

impl OpenAiExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("extraction.model required for OpenAI provider"))?;
        let client = OpenAiClient::new(
            config.url.as_deref(),
            config.step_timeout_secs,
            config.max_retries,
        )?;
        Ok(Self { client, model })
    }
}

fn system_prompt(step: ExtractionStep, params: &StepParams) -> String {
    match step {
        ExtractionStep::Title => {
            "Give a concise title for the document the following passages come from. \
             Reply with the title only."
                .to_string()
        }
        ExtractionStep::PassageSummary => {
            "Summarize the key topics and entities of the following passage. \
             Reply with the summary only."
                .to_string()
        }
        ExtractionStep::DocumentSummary => {
            "Summarize the following document in a short paragraph. Reply with the summary only."
                .to_string()
        }
        ExtractionStep::Keywords => format!(
            "Give {} unique keywords for the following passage. \
             Reply in the format '{} <comma-separated keywords>'.",
            params.count.unwrap_or(5),
            KEYWORDS_PREFIX
        ),
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn run(&self, step: ExtractionStep, text: &str, params: &StepParams) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": params.max_tokens,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system_prompt(step, params) },
                { "role": "user", "content": text },
            ],
        });
        let json = self.client.post_json("chat/completions", &body).await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing message content"))
}
