//! # Refindex Core
//!
//! Shared, runtime-agnostic logic for refindex: the reference data model,
//! keyword normalization, passage segmentation, transformation
//! fingerprints, the capability traits the pipeline consumes, and the
//! storage abstraction with an in-memory backend.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! `refindex` application crate supplies the SQLite store, concrete
//! providers, and the indexing runtime.

pub mod capability;
pub mod chunk;
pub mod embedding;
pub mod fingerprint;
pub mod keywords;
pub mod models;
pub mod store;
