//! In-memory [`Store`] and [`TransformCache`] implementations.
//!
//! All tables live behind a single `std::sync::RwLock`, so every trait
//! method is atomic with respect to the others, which is how the in-memory
//! store mirrors SQLite's transactional commit.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::fingerprint::content_hash;
use crate::keywords::normalize_keyword;
use crate::models::{
    CommitOutcome, DerivedPassage, IndexStatus, IndexedDocument, InsertOutcome, NewReference,
    Reference, ReferenceKind,
};

use super::{Store, TransformCache};

struct StoredReference {
    reference: Reference,
    contents: String,
    content_hash: String,
    seq: u64,
}

impl StoredReference {
    fn view(&self, include_contents: bool) -> Reference {
        let mut r = self.reference.clone();
        if include_contents {
            r.contents = Some(self.contents.clone());
        }
        r
    }
}

#[derive(Default)]
struct Tables {
    references: HashMap<String, StoredReference>,
    by_source: HashMap<(ReferenceKind, String), String>,
    keywords: BTreeSet<String>,
    associations: HashMap<String, BTreeSet<String>>,
    passages: HashMap<String, Vec<DerivedPassage>>,
    next_seq: u64,
}

impl Tables {
    fn matching_all(&self, keywords: &[String]) -> Vec<String> {
        self.associations
            .iter()
            .filter(|(_, kws)| keywords.iter().all(|k| kws.contains(k)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// In-memory store for tests and embedding in other runtimes.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_reference(&self, new: &NewReference) -> Result<InsertOutcome> {
        let mut t = self.tables.write().unwrap();
        let key = (new.kind, new.source.clone());
        if let Some(existing) = t.by_source.get(&key).and_then(|id| t.references.get(id)) {
            return Ok(InsertOutcome::Existing(existing.view(false)));
        }

        let seq = t.next_seq;
        t.next_seq += 1;
        let reference = Reference {
            id: new.id.clone(),
            kind: new.kind,
            source: new.source.clone(),
            title: None,
            summary: None,
            contents: None,
            indexed: false,
            status: IndexStatus::Pending,
            index_error: None,
            created_at: new.created_at,
            indexed_at: None,
            keywords: None,
        };
        let stored = StoredReference {
            reference,
            contents: new.contents.clone(),
            content_hash: new.content_hash.clone(),
            seq,
        };
        let view = stored.view(true);
        t.by_source.insert(key, new.id.clone());
        t.references.insert(new.id.clone(), stored);
        Ok(InsertOutcome::Created(view))
    }

    async fn find_by_source(&self, kind: ReferenceKind, source: &str) -> Result<Option<Reference>> {
        let t = self.tables.read().unwrap();
        Ok(t.by_source
            .get(&(kind, source.to_string()))
            .and_then(|id| t.references.get(id))
            .map(|s| s.view(false)))
    }

    async fn get_references(&self, ids: &[String], include_contents: bool) -> Result<Vec<Reference>> {
        let t = self.tables.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| t.references.get(id))
            .map(|s| s.view(include_contents))
            .collect())
    }

    async fn list_references(
        &self,
        include_contents: bool,
        keywords: &[String],
    ) -> Result<Vec<Reference>> {
        let t = self.tables.read().unwrap();
        let mut rows: Vec<&StoredReference> = if keywords.is_empty() {
            t.references.values().collect()
        } else {
            t.matching_all(keywords)
                .iter()
                .filter_map(|id| t.references.get(id))
                .collect()
        };
        rows.sort_by(|a, b| {
            b.reference
                .created_at
                .cmp(&a.reference.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(rows.into_iter().map(|s| s.view(include_contents)).collect())
    }

    async fn get_contents(&self, id: &str) -> Result<Option<String>> {
        let t = self.tables.read().unwrap();
        Ok(t.references.get(id).map(|s| s.contents.clone()))
    }

    async fn reset_for_indexing(&self, id: &str, contents: Option<&str>) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        let Some(stored) = t.references.get_mut(id) else {
            return Ok(false);
        };
        stored.reference.indexed = false;
        stored.reference.status = IndexStatus::Pending;
        stored.reference.index_error = None;
        if let Some(contents) = contents {
            stored.contents = contents.to_string();
            stored.content_hash = content_hash(contents);
        }
        Ok(true)
    }

    async fn commit_indexing(&self, doc: &IndexedDocument) -> Result<CommitOutcome> {
        let mut t = self.tables.write().unwrap();
        match t.references.get_mut(&doc.reference_id) {
            None => return Ok(CommitOutcome::Missing),
            Some(stored) if stored.content_hash != doc.content_hash => {
                return Ok(CommitOutcome::Superseded)
            }
            Some(stored) => {
                stored.reference.title = doc.title.clone();
                stored.reference.summary = doc.summary.clone();
                stored.reference.indexed = true;
                stored.reference.status = IndexStatus::Indexed;
                stored.reference.index_error = None;
                stored.reference.indexed_at = Some(Utc::now());
            }
        }

        let keywords: BTreeSet<String> = doc
            .keywords
            .iter()
            .map(|k| normalize_keyword(k))
            .filter(|k| !k.is_empty())
            .collect();
        t.keywords.extend(keywords.iter().cloned());
        t.associations.insert(doc.reference_id.clone(), keywords);
        t.passages
            .insert(doc.reference_id.clone(), doc.passages.clone());
        Ok(CommitOutcome::Committed)
    }

    async fn mark_failed(&self, id: &str, content_hash: &str, error: &str) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        match t.references.get_mut(id) {
            Some(stored) if stored.content_hash == content_hash => {
                stored.reference.indexed = false;
                stored.reference.status = IndexStatus::Failed;
                stored.reference.index_error = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_reference(&self, id: &str) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        let Some(stored) = t.references.remove(id) else {
            return Ok(false);
        };
        t.by_source
            .remove(&(stored.reference.kind, stored.reference.source));
        t.associations.remove(id);
        t.passages.remove(id);
        Ok(true)
    }

    async fn list_keywords(&self) -> Result<Vec<String>> {
        let t = self.tables.read().unwrap();
        Ok(t.keywords.iter().cloned().collect())
    }

    async fn keywords_for(&self, id: &str) -> Result<Vec<String>> {
        let t = self.tables.read().unwrap();
        Ok(t.associations
            .get(id)
            .map(|kws| kws.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn reference_ids_matching_all(&self, keywords: &[String]) -> Result<Vec<String>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let t = self.tables.read().unwrap();
        let mut ids = t.matching_all(keywords);
        ids.sort();
        Ok(ids)
    }

    async fn keyword_counts(&self, selected: &[String]) -> Result<Vec<(String, i64)>> {
        let t = self.tables.read().unwrap();
        let qualifying: Vec<String> = if selected.is_empty() {
            t.associations.keys().cloned().collect()
        } else {
            t.matching_all(selected)
        };

        let mut counts: HashMap<&str, i64> = HashMap::new();
        for id in &qualifying {
            if let Some(kws) = t.associations.get(id) {
                for kw in kws {
                    *counts.entry(kw.as_str()).or_default() += 1;
                }
            }
        }

        let mut out: Vec<(String, i64)> = counts
            .into_iter()
            .map(|(k, c)| (k.to_string(), c))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(out)
    }

    async fn passages_for(&self, id: &str) -> Result<Vec<DerivedPassage>> {
        let t = self.tables.read().unwrap();
        Ok(t.passages.get(id).cloned().unwrap_or_default())
    }
}

/// In-memory transformation cache.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TransformCache for InMemoryCache {
    async fn get(&self, fingerprint: &str) -> Result<Option<String>> {
        Ok(self.entries.read().unwrap().get(fingerprint).cloned())
    }

    async fn put(&self, fingerprint: &str, _step: &str, output: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap()
            .entry(fingerprint.to_string())
            .or_insert_with(|| output.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(id: &str, hash: &str, keywords: &[&str]) -> IndexedDocument {
        IndexedDocument {
            reference_id: id.to_string(),
            content_hash: hash.to_string(),
            title: Some("Title".into()),
            summary: Some("Summary".into()),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            passages: Vec::new(),
        }
    }

    async fn add(store: &InMemoryStore, source: &str, keywords: &[&str]) -> String {
        let new = NewReference::new(ReferenceKind::Url, source, format!("body of {}", source));
        let r = store.insert_reference(&new).await.unwrap().into_reference();
        let outcome = store
            .commit_indexing(&indexed(&r.id, &new.content_hash, keywords))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        r.id
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_insert_same_source_returns_existing() {
        let store = InMemoryStore::new();
        let a = NewReference::new(ReferenceKind::Url, "https://x", "one".into());
        let b = NewReference::new(ReferenceKind::Url, "https://x", "two".into());
        let first = store.insert_reference(&a).await.unwrap();
        let second = store.insert_reference(&b).await.unwrap();
        assert!(matches!(first, InsertOutcome::Created(_)));
        match second {
            InsertOutcome::Existing(r) => assert_eq!(r.id, a.id),
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(store.list_references(false, &[]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_intersection_requires_every_keyword() {
        let store = InMemoryStore::new();
        let ab = add(&store, "https://ab", &["a", "b"]).await;
        let _a = add(&store, "https://a", &["a"]).await;

        let ids = store
            .reference_ids_matching_all(&strings(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(ids, vec![ab.clone()]);

        let listed = store
            .list_references(false, &strings(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, ab);
    }

    #[tokio::test]
    async fn test_counts_short_circuit_on_empty_intersection() {
        let store = InMemoryStore::new();
        add(&store, "https://1", &["a"]).await;
        add(&store, "https://2", &["b"]).await;
        let counts = store.keyword_counts(&strings(&["a", "b"])).await.unwrap();
        assert!(counts.is_empty());
    }

    #[tokio::test]
    async fn test_counts_over_qualifying_subset() {
        let store = InMemoryStore::new();
        add(&store, "https://1", &["a", "b", "c"]).await;
        add(&store, "https://2", &["a", "b"]).await;
        add(&store, "https://3", &["a", "d"]).await;

        let all = store.keyword_counts(&[]).await.unwrap();
        assert_eq!(all[0], ("a".to_string(), 3));

        let sel = store.keyword_counts(&strings(&["a", "b"])).await.unwrap();
        assert_eq!(
            sel,
            vec![("a".into(), 2), ("b".into(), 2), ("c".into(), 1)]
        );
    }

    #[tokio::test]
    async fn test_commit_replaces_keywords() {
        let store = InMemoryStore::new();
        let new = NewReference::new(ReferenceKind::Url, "https://r", "v1".into());
        let id = store.insert_reference(&new).await.unwrap().into_reference().id;
        store
            .commit_indexing(&indexed(&id, &new.content_hash, &["a", "b"]))
            .await
            .unwrap();

        store.reset_for_indexing(&id, Some("v2")).await.unwrap();
        let v2 = content_hash("v2");
        store
            .commit_indexing(&indexed(&id, &v2, &["c"]))
            .await
            .unwrap();
        assert_eq!(store.keywords_for(&id).await.unwrap(), vec!["c"]);
        assert_eq!(store.list_keywords().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stale_commit_superseded() {
        let store = InMemoryStore::new();
        let new = NewReference::new(ReferenceKind::Url, "https://r", "v1".into());
        let id = store.insert_reference(&new).await.unwrap().into_reference().id;
        store.reset_for_indexing(&id, Some("v2")).await.unwrap();

        let outcome = store
            .commit_indexing(&indexed(&id, &new.content_hash, &["old"]))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Superseded);
        let r = &store.get_references(&[id.clone()], false).await.unwrap()[0];
        assert!(!r.indexed);
        assert!(store.keywords_for(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_drops_associations() {
        let store = InMemoryStore::new();
        let id = add(&store, "https://d", &["a"]).await;
        assert!(store.delete_reference(&id).await.unwrap());
        assert!(store.keywords_for(&id).await.unwrap().is_empty());
        assert!(store.keyword_counts(&[]).await.unwrap().is_empty());
        assert_eq!(
            store
                .commit_indexing(&indexed(&id, "x", &["a"]))
                .await
                .unwrap(),
            CommitOutcome::Missing
        );
        assert!(!store.delete_reference(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_first_write_wins() {
        let cache = InMemoryCache::new();
        cache.put("fp", "title", "one").await.unwrap();
        cache.put("fp", "title", "two").await.unwrap();
        assert_eq!(cache.get("fp").await.unwrap().as_deref(), Some("one"));
        assert_eq!(cache.len(), 1);
    }
}
