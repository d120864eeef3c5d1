//! Database schema migrations (idempotent).
//!
//! Relational tables for the reference catalog (`references`, `keywords`,
//! `references_keywords`), the derived-node store (`passages`,
//! `passage_vectors`) and the transformation cache (`transform_cache`).

use anyhow::Result;
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS "references" (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        source TEXT NOT NULL,
        title TEXT,
        summary TEXT,
        contents TEXT,
        content_hash TEXT,
        indexed INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        index_error TEXT,
        created_at INTEGER NOT NULL,
        indexed_at INTEGER,
        UNIQUE(type, source)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keywords (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        keyword TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS references_keywords (
        reference_id TEXT NOT NULL,
        keyword_id INTEGER NOT NULL,
        UNIQUE(reference_id, keyword_id),
        FOREIGN KEY (reference_id) REFERENCES "references"(id) ON DELETE CASCADE,
        FOREIGN KEY (keyword_id) REFERENCES keywords(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS passages (
        reference_id TEXT NOT NULL,
        passage_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        summary TEXT,
        keywords_excerpt TEXT,
        PRIMARY KEY (reference_id, passage_index),
        FOREIGN KEY (reference_id) REFERENCES "references"(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS passage_vectors (
        reference_id TEXT NOT NULL,
        passage_index INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        PRIMARY KEY (reference_id, passage_index),
        FOREIGN KEY (reference_id, passage_index)
            REFERENCES passages(reference_id, passage_index) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transform_cache (
        fingerprint TEXT PRIMARY KEY,
        step TEXT NOT NULL,
        output TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_references_created_at ON \"references\"(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_references_keywords_keyword ON references_keywords(keyword_id)",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
