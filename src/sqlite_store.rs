//! SQLite-backed [`Store`] and [`TransformCache`] implementation.
//!
//! Every [`Store`] operation maps to one or more statements against the
//! schema created by [`crate::migrate`]. The two invariants that matter
//! under concurrent writers are enforced by the database, not by prior
//! reads:
//!
//! - `UNIQUE(type, source)` plus `ON CONFLICT DO NOTHING` makes duplicate
//!   `add` calls resolve to the row that won the insert.
//! - `keywords.keyword UNIQUE` plus insert-or-ignore-then-select makes
//!   keyword upserts race-safe inside the indexing transaction.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use refindex_core::embedding::{blob_to_vec, vec_to_blob};
use refindex_core::fingerprint::content_hash;
use refindex_core::keywords::normalize_keyword;
use refindex_core::models::{
    CommitOutcome, DerivedPassage, IndexedDocument, InsertOutcome, NewReference, Reference,
    ReferenceKind,
};
use refindex_core::store::{Store, TransformCache};

const REFERENCE_COLUMNS: &str =
    "id, type, source, title, summary, indexed, status, index_error, created_at, indexed_at";

/// SQLite implementation of [`Store`] and [`TransformCache`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

/// Map a raw `references` row to a [`Reference`].
///
/// The single place where storage types become domain types: text ids,
/// integer booleans, millisecond timestamps and enum strings.
fn reference_from_row(row: &SqliteRow, include_contents: bool) -> Result<Reference> {
    let kind: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    let created_at: i64 = row.try_get("created_at")?;
    let indexed_at: Option<i64> = row.try_get("indexed_at")?;

    Ok(Reference {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        source: row.try_get("source")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        contents: if include_contents {
            row.try_get("contents")?
        } else {
            None
        },
        indexed: row.try_get::<i64, _>("indexed")? != 0,
        status: status.parse()?,
        index_error: row.try_get("index_error")?,
        created_at: millis_to_datetime(created_at)?,
        indexed_at: indexed_at.map(millis_to_datetime).transpose()?,
        keywords: None,
    })
}

fn select_columns(include_contents: bool) -> String {
    if include_contents {
        format!("{}, contents", REFERENCE_COLUMNS)
    } else {
        REFERENCE_COLUMNS.to_string()
    }
}

/// Push a subquery selecting ids of references tagged with every keyword.
fn push_matching_all(qb: &mut QueryBuilder<'_, Sqlite>, keywords: &[String]) {
    qb.push(
        "SELECT rk.reference_id FROM references_keywords rk \
         JOIN keywords k ON k.id = rk.keyword_id WHERE k.keyword IN (",
    );
    let mut sep = qb.separated(", ");
    for kw in keywords {
        sep.push_bind(kw.clone());
    }
    qb.push(") GROUP BY rk.reference_id HAVING COUNT(DISTINCT k.keyword) = ");
    qb.push_bind(keywords.len() as i64);
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_reference(&self, new: &NewReference) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO "references" (id, type, source, contents, content_hash, indexed, status, created_at)
            VALUES (?, ?, ?, ?, ?, 0, 'pending', ?)
            ON CONFLICT(type, source) DO NOTHING
            "#,
        )
        .bind(&new.id)
        .bind(new.kind.as_str())
        .bind(&new.source)
        .bind(&new.contents)
        .bind(&new.content_hash)
        .bind(new.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self
                .find_by_source(new.kind, &new.source)
                .await?
                .map(InsertOutcome::Existing)
                .ok_or_else(|| anyhow!("reference for {} vanished after insert conflict", new.source));
        }

        self.get_references(std::slice::from_ref(&new.id), true)
            .await?
            .into_iter()
            .next()
            .map(InsertOutcome::Created)
            .ok_or_else(|| anyhow!("inserted reference {} not found", new.id))
    }

    async fn find_by_source(&self, kind: ReferenceKind, source: &str) -> Result<Option<Reference>> {
        let sql = format!(
            "SELECT {} FROM \"references\" WHERE type = ? AND source = ? LIMIT 1",
            REFERENCE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| reference_from_row(&r, false)).transpose()
    }

    async fn get_references(&self, ids: &[String], include_contents: bool) -> Result<Vec<Reference>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM \"references\" WHERE id IN (",
            select_columns(include_contents)
        ));
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id.clone());
        }
        qb.push(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut refs = rows
            .iter()
            .map(|row| reference_from_row(row, include_contents))
            .collect::<Result<Vec<_>>>()?;
        refs.sort_by_key(|r| ids.iter().position(|id| *id == r.id));
        Ok(refs)
    }

    async fn list_references(
        &self,
        include_contents: bool,
        keywords: &[String],
    ) -> Result<Vec<Reference>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM \"references\"",
            select_columns(include_contents)
        ));
        if !keywords.is_empty() {
            qb.push(" WHERE id IN (");
            push_matching_all(&mut qb, keywords);
            qb.push(")");
        }
        qb.push(" ORDER BY created_at DESC, rowid DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| reference_from_row(row, include_contents))
            .collect()
    }

    async fn get_contents(&self, id: &str) -> Result<Option<String>> {
        let contents: Option<Option<String>> =
            sqlx::query_scalar("SELECT contents FROM \"references\" WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(contents.flatten())
    }

    async fn reset_for_indexing(&self, id: &str, contents: Option<&str>) -> Result<bool> {
        let result = match contents {
            Some(contents) => {
                sqlx::query(
                    r#"
                    UPDATE "references"
                    SET indexed = 0, status = 'pending', index_error = NULL,
                        contents = ?, content_hash = ?
                    WHERE id = ?
                    "#,
                )
                .bind(contents)
                .bind(content_hash(contents))
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE "references"
                    SET indexed = 0, status = 'pending', index_error = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn commit_indexing(&self, doc: &IndexedDocument) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE "references"
            SET title = ?, summary = ?, indexed = 1, status = 'indexed',
                index_error = NULL, indexed_at = ?
            WHERE id = ? AND content_hash = ?
            "#,
        )
        .bind(&doc.title)
        .bind(&doc.summary)
        .bind(Utc::now().timestamp_millis())
        .bind(&doc.reference_id)
        .bind(&doc.content_hash)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM \"references\" WHERE id = ?")
                    .bind(&doc.reference_id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(if exists {
                CommitOutcome::Superseded
            } else {
                CommitOutcome::Missing
            });
        }

        sqlx::query("DELETE FROM references_keywords WHERE reference_id = ?")
            .bind(&doc.reference_id)
            .execute(&mut *tx)
            .await?;

        for keyword in doc.keywords.iter().map(|k| normalize_keyword(k)) {
            if keyword.is_empty() {
                continue;
            }
            sqlx::query("INSERT INTO keywords (keyword) VALUES (?) ON CONFLICT(keyword) DO NOTHING")
                .bind(&keyword)
                .execute(&mut *tx)
                .await?;
            let keyword_id: i64 = sqlx::query_scalar("SELECT id FROM keywords WHERE keyword = ?")
                .bind(&keyword)
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO references_keywords (reference_id, keyword_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(&doc.reference_id)
            .bind(keyword_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM passage_vectors WHERE reference_id = ?")
            .bind(&doc.reference_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM passages WHERE reference_id = ?")
            .bind(&doc.reference_id)
            .execute(&mut *tx)
            .await?;

        for passage in &doc.passages {
            sqlx::query(
                r#"
                INSERT INTO passages (reference_id, passage_index, text, summary, keywords_excerpt)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&doc.reference_id)
            .bind(passage.index)
            .bind(&passage.text)
            .bind(&passage.summary)
            .bind(&passage.keywords_excerpt)
            .execute(&mut *tx)
            .await?;

            if let Some(vector) = &passage.embedding {
                sqlx::query(
                    "INSERT INTO passage_vectors (reference_id, passage_index, embedding) VALUES (?, ?, ?)",
                )
                .bind(&doc.reference_id)
                .bind(passage.index)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn mark_failed(&self, id: &str, content_hash: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE "references"
            SET indexed = 0, status = 'failed', index_error = ?
            WHERE id = ? AND content_hash = ?
            "#,
        )
        .bind(error)
        .bind(id)
        .bind(content_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_reference(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM passage_vectors WHERE reference_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM passages WHERE reference_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        // references_keywords rows go with the reference via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM \"references\" WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_keywords(&self) -> Result<Vec<String>> {
        let keywords: Vec<String> = sqlx::query_scalar("SELECT keyword FROM keywords ORDER BY keyword")
            .fetch_all(&self.pool)
            .await?;
        Ok(keywords)
    }

    async fn keywords_for(&self, id: &str) -> Result<Vec<String>> {
        let keywords: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT k.keyword
            FROM keywords k
            JOIN references_keywords rk ON k.id = rk.keyword_id
            WHERE rk.reference_id = ?
            ORDER BY k.keyword
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(keywords)
    }

    async fn reference_ids_matching_all(&self, keywords: &[String]) -> Result<Vec<String>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("");
        push_matching_all(&mut qb, keywords);
        qb.push(" ORDER BY rk.reference_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("reference_id").map_err(Into::into))
            .collect()
    }

    async fn keyword_counts(&self, selected: &[String]) -> Result<Vec<(String, i64)>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT k.keyword AS keyword, COUNT(DISTINCT rk.reference_id) AS count \
             FROM keywords k JOIN references_keywords rk ON k.id = rk.keyword_id",
        );
        // An empty qualifying set yields no rows, so the short-circuit is implicit.
        if !selected.is_empty() {
            qb.push(" WHERE rk.reference_id IN (");
            push_matching_all(&mut qb, selected);
            qb.push(")");
        }
        qb.push(" GROUP BY k.keyword ORDER BY count DESC, k.keyword ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(String, i64)> {
                Ok((row.try_get("keyword")?, row.try_get("count")?))
            })
            .collect()
    }

    async fn passages_for(&self, id: &str) -> Result<Vec<DerivedPassage>> {
        let rows = sqlx::query(
            r#"
            SELECT p.passage_index, p.text, p.summary, p.keywords_excerpt, v.embedding
            FROM passages p
            LEFT JOIN passage_vectors v
              ON v.reference_id = p.reference_id AND v.passage_index = p.passage_index
            WHERE p.reference_id = ?
            ORDER BY p.passage_index
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DerivedPassage> {
                let blob: Option<Vec<u8>> = row.try_get("embedding")?;
                Ok(DerivedPassage {
                    index: row.try_get("passage_index")?,
                    text: row.try_get("text")?,
                    summary: row.try_get("summary")?,
                    keywords_excerpt: row.try_get("keywords_excerpt")?,
                    embedding: blob.map(|b| blob_to_vec(&b)),
                })
            })
            .collect()
    }
}

#[async_trait]
impl TransformCache for SqliteStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<String>> {
        let output: Option<String> =
            sqlx::query_scalar("SELECT output FROM transform_cache WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(output)
    }

    async fn put(&self, fingerprint: &str, step: &str, output: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transform_cache (fingerprint, step, output, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint)
        .bind(step)
        .bind(output)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::run_migrations;
    use refindex_core::models::IndexStatus;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("t.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn doc(id: &str, hash: &str, keywords: &[&str]) -> IndexedDocument {
        IndexedDocument {
            reference_id: id.to_string(),
            content_hash: hash.to_string(),
            title: Some("T".into()),
            summary: Some("S".into()),
            keywords: keywords.iter().map(|k| k.to_string()).collect::<BTreeSet<_>>(),
            passages: vec![DerivedPassage {
                index: 0,
                text: "p".into(),
                summary: Some("ps".into()),
                keywords_excerpt: Some("Keywords: x".into()),
                embedding: Some(vec![0.5, -1.0]),
            }],
        }
    }

    async fn indexed_ref(store: &SqliteStore, source: &str, keywords: &[&str]) -> String {
        let new = NewReference::new(ReferenceKind::Url, source, format!("contents {}", source));
        let id = store.insert_reference(&new).await.unwrap().into_reference().id;
        let outcome = store
            .commit_indexing(&doc(&id, &new.content_hash, keywords))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        id
    }

    #[tokio::test]
    async fn test_insert_conflict_returns_existing() {
        let (_tmp, store) = setup().await;
        let a = NewReference::new(ReferenceKind::Url, "https://x", "a".into());
        let b = NewReference::new(ReferenceKind::Url, "https://x", "b".into());

        let created = store.insert_reference(&a).await.unwrap();
        let created = match created {
            InsertOutcome::Created(r) => r,
            other => panic!("expected created, got {:?}", other),
        };
        assert_eq!(created.contents.as_deref(), Some("a"));
        assert_eq!(created.status, IndexStatus::Pending);
        assert!(!created.indexed);

        match store.insert_reference(&b).await.unwrap() {
            InsertOutcome::Existing(r) => assert_eq!(r.id, a.id),
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(store.get_contents(&a.id).await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_commit_round_trips_passages() {
        let (_tmp, store) = setup().await;
        let id = indexed_ref(&store, "https://p", &["Rust Lang", "tokio"]).await;

        let r = &store.get_references(&[id.clone()], false).await.unwrap()[0];
        assert!(r.indexed);
        assert_eq!(r.status, IndexStatus::Indexed);
        assert_eq!(r.title.as_deref(), Some("T"));
        assert!(r.indexed_at.is_some());
        assert!(r.contents.is_none());

        assert_eq!(store.keywords_for(&id).await.unwrap(), vec!["rust_lang", "tokio"]);
        let passages = store.passages_for(&id).await.unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].embedding, Some(vec![0.5, -1.0]));
    }

    #[tokio::test]
    async fn test_keyword_rows_shared_between_references() {
        let (_tmp, store) = setup().await;
        indexed_ref(&store, "https://1", &["shared", "one"]).await;
        indexed_ref(&store, "https://2", &["Shared", "two"]).await;
        assert_eq!(
            store.list_keywords().await.unwrap(),
            vec!["one", "shared", "two"]
        );
    }

    #[tokio::test]
    async fn test_intersection_and_counts() {
        let (_tmp, store) = setup().await;
        let ab = indexed_ref(&store, "https://ab", &["a", "b", "c"]).await;
        indexed_ref(&store, "https://a", &["a"]).await;

        let filter = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            store.reference_ids_matching_all(&filter).await.unwrap(),
            vec![ab.clone()]
        );
        let listed = store.list_references(false, &filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, ab);

        let counts = store.keyword_counts(&filter).await.unwrap();
        assert_eq!(
            counts,
            vec![("a".into(), 1), ("b".into(), 1), ("c".into(), 1)]
        );
        let all = store.keyword_counts(&[]).await.unwrap();
        assert_eq!(all[0], ("a".to_string(), 2));

        let none = store
            .keyword_counts(&["b".to_string(), "zzz".to_string()])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_associations() {
        let (_tmp, store) = setup().await;
        let id = indexed_ref(&store, "https://d", &["gone"]).await;
        assert!(store.delete_reference(&id).await.unwrap());

        let orphans: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM references_keywords WHERE reference_id = ?")
                .bind(&id)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(orphans, 0);
        assert!(store.passages_for(&id).await.unwrap().is_empty());
        // Keyword rows themselves may stay orphaned.
        assert_eq!(store.list_keywords().await.unwrap(), vec!["gone"]);
        assert!(!store.delete_reference(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_outcomes_for_stale_and_missing() {
        let (_tmp, store) = setup().await;
        let new = NewReference::new(ReferenceKind::Url, "https://s", "v1".into());
        let id = store.insert_reference(&new).await.unwrap().into_reference().id;
        assert!(store.reset_for_indexing(&id, Some("v2")).await.unwrap());

        let stale = store
            .commit_indexing(&doc(&id, &new.content_hash, &["old"]))
            .await
            .unwrap();
        assert_eq!(stale, CommitOutcome::Superseded);
        assert!(store.keywords_for(&id).await.unwrap().is_empty());
        assert!(!store.mark_failed(&id, &new.content_hash, "boom").await.unwrap());

        let missing = store
            .commit_indexing(&doc("nope", "h", &["x"]))
            .await
            .unwrap();
        assert_eq!(missing, CommitOutcome::Missing);
    }

    #[tokio::test]
    async fn test_mark_failed_records_error() {
        let (_tmp, store) = setup().await;
        let new = NewReference::new(ReferenceKind::Url, "https://f", "v".into());
        let id = store.insert_reference(&new).await.unwrap().into_reference().id;
        assert!(store.mark_failed(&id, &new.content_hash, "timeout").await.unwrap());
        let r = store.find_by_source(ReferenceKind::Url, "https://f").await.unwrap().unwrap();
        assert_eq!(r.status, IndexStatus::Failed);
        assert_eq!(r.index_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_cache_insert_if_absent() {
        let (_tmp, store) = setup().await;
        store.put("fp", "title", "first").await.unwrap();
        store.put("fp", "title", "second").await.unwrap();
        assert_eq!(store.get("fp").await.unwrap().as_deref(), Some("first"));
        assert!(store.get("other").await.unwrap().is_none());
    }
}
