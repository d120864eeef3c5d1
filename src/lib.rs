//! # refindex
//!
//! A reference catalog: ingests web pages, extracts titles, summaries,
//! keywords and embeddings in the background, and answers exact
//! keyword-intersection queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌────────────┐   ┌──────────┐
//! │ Fetcher  │──▶│ ReferenceStore │──▶│ IndexQueue │──▶│ Pipeline │
//! │ (HTTP)   │   │  add/reindex   │   │  workers   │   │ + cache  │
//! └──────────┘   └───────┬────────┘   └─────┬──────┘   └────┬─────┘
//!                        │                  │ commit        │
//!                        ▼                  ▼               │
//!                   ┌─────────────────────────────┐         │
//!                   │ SQLite: references,         │◀────────┘
//!                   │ keywords, passages, cache   │
//!                   └──────────────┬──────────────┘
//!                       ┌──────────┴─────────┐
//!                       ▼                    ▼
//!                  ┌──────────┐        ┌──────────┐
//!                  │   CLI    │        │   HTTP   │
//!                  │  (refx)  │        │  (axum)  │
//!                  └──────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! refx init
//! refx add https://example.com/cats --wait
//! refx list --keyword cats
//! refx serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite storage backend and transformation cache |
//! | [`fetch`] | HTTP content fetcher |
//! | [`extract`] | Title, summary and keyword extractors |
//! | [`embedding`] | Embedding providers |
//! | [`pipeline`] | Cached extraction pipeline |
//! | [`queue`] | Coalescing indexing worker pool |
//! | [`references`] | Reference lifecycle service |
//! | [`keywords`] | Keyword queries |
//! | [`server`] | HTTP API |
//!
//! Pure logic (data model, normalization, segmentation, fingerprints,
//! storage traits) lives in the `refindex-core` crate.

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod indexer;
pub mod keywords;
pub mod migrate;
pub mod openai;
pub mod pipeline;
pub mod queue;
pub mod references;
pub mod server;
pub mod sqlite_store;

pub use error::{Error, Result};
pub use references::{ReferenceStore, ReferenceStoreConfig};
