//! In-memory annotation store for deterministic testing.
//!
//! Implements [`AnnotationStore`] with real version-token semantics, a call
//! log for assertions, and fault injection per operation (optionally per id).
//!
//! ## Usage
//!
//! ```rust
//! use annolink_store::mock::{InMemoryStore, MockOp};
//! use annolink_core::{AnnotationStore, Error};
//!
//! # tokio_test_block_on(async {
//! let store = InMemoryStore::new("https://store.example/w3c", "maps");
//! let a = store.insert_primary("a");
//! store.fail_next(MockOp::Get, Error::Timeout("slow".into()));
//! assert!(store.get(&a).await.is_err());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use annolink_core::document::{has_motivation_or_purpose, raw_id, raw_targets};
use annolink_core::{
    AnnotationId, AnnotationStore, Error, ExistenceCheck, IdCanonicalizer, ListingPage, Result,
    StoredAnnotation, VersionToken,
};

/// Store operations, for the call log and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Get,
    Exists,
    Create,
    Update,
    Delete,
    Query,
    List,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub op: MockOp,
    pub id: Option<AnnotationId>,
}

#[derive(Debug, Clone)]
struct Fault {
    op: MockOp,
    id: Option<AnnotationId>,
    error: Error,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MockState {
    documents: BTreeMap<AnnotationId, (JsonValue, u64)>,
    primaries: BTreeSet<AnnotationId>,
    next_id: u64,
    calls: Vec<MockCall>,
    faults: Vec<Fault>,
}

/// In-memory store shared between a test and the engine under test.
#[derive(Clone)]
pub struct InMemoryStore {
    canonicalizer: IdCanonicalizer,
    page_size: usize,
    state: Arc<Mutex<MockState>>,
}

impl InMemoryStore {
    pub fn new(base_url: &str, container: &str) -> Self {
        Self {
            canonicalizer: IdCanonicalizer::new(base_url, container),
            page_size: 100,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Set the listing page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn canonical(&self, raw: &str) -> AnnotationId {
        self.canonicalizer
            .canonicalize(raw)
            .unwrap_or_else(|| AnnotationId::new(raw))
    }

    /// Register a primary annotation so existence checks find it.
    pub fn insert_primary(&self, raw_id: &str) -> AnnotationId {
        let id = self.canonical(raw_id);
        self.lock().primaries.insert(id.clone());
        id
    }

    /// Remove a primary annotation, as its producer would.
    pub fn remove_primary(&self, id: &AnnotationId) {
        self.lock().primaries.remove(id);
    }

    /// Seed a document as-is. Its `id` is canonicalized (or assigned).
    pub fn insert_document(&self, mut document: JsonValue) -> AnnotationId {
        let mut state = self.lock();
        let id = match raw_id(&document) {
            Some(raw) => self.canonical(raw),
            None => {
                state.next_id += 1;
                self.canonical(&format!("seed-{}", state.next_id))
            }
        };
        if let Some(obj) = document.as_object_mut() {
            obj.insert("id".to_string(), JsonValue::String(id.to_string()));
        }
        state.documents.insert(id.clone(), (document, 1));
        id
    }

    pub fn document(&self, id: &AnnotationId) -> Option<JsonValue> {
        self.lock().documents.get(id).map(|(doc, _)| doc.clone())
    }

    pub fn contains(&self, id: &AnnotationId) -> bool {
        self.lock().documents.contains_key(id)
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    /// Simulate a concurrent editor: bump the stored version so tokens read
    /// earlier become stale.
    pub fn touch(&self, id: &AnnotationId) {
        if let Some((_, version)) = self.lock().documents.get_mut(id) {
            *version += 1;
        }
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: MockOp, error: Error) {
        self.lock().faults.push(Fault {
            op,
            id: None,
            error,
            remaining: Some(1),
        });
    }

    /// Fail every call of `op` on `id` with `error`.
    pub fn fail_always_for(&self, op: MockOp, id: &AnnotationId, error: Error) {
        self.lock().faults.push(Fault {
            op,
            id: Some(id.clone()),
            error,
            remaining: None,
        });
    }

    /// Fail every call of `op` with `error`.
    pub fn fail_always(&self, op: MockOp, error: Error) {
        self.lock().faults.push(Fault {
            op,
            id: None,
            error,
            remaining: None,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Get all logged calls for assertion.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Log the call and return an injected fault, if any applies.
    fn enter(&self, op: MockOp, id: Option<&AnnotationId>) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall {
            op,
            id: id.cloned(),
        });
        let position = state.faults.iter().position(|f| {
            f.op == op && (f.id.is_none() || f.id.as_ref() == id)
        });
        let Some(position) = position else {
            return Ok(());
        };
        let error = state.faults[position].error.clone();
        match state.faults[position].remaining {
            Some(n) if n <= 1 => {
                state.faults.remove(position);
            }
            Some(n) => state.faults[position].remaining = Some(n - 1),
            None => {}
        }
        Err(error)
    }

    fn etag(version: u64) -> VersionToken {
        VersionToken::new(format!("W/\"{}\"", version))
    }

    fn check_version(
        state: &MockState,
        id: &AnnotationId,
        version: &VersionToken,
    ) -> Result<u64> {
        let (_, current) = state
            .documents
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if Self::etag(*current) != *version {
            return Err(Error::VersionConflict(id.to_string()));
        }
        Ok(*current)
    }
}

#[async_trait]
impl AnnotationStore for InMemoryStore {
    fn canonicalizer(&self) -> &IdCanonicalizer {
        &self.canonicalizer
    }

    async fn get(&self, id: &AnnotationId) -> Result<StoredAnnotation> {
        self.enter(MockOp::Get, Some(id))?;
        let state = self.lock();
        let (document, version) = state
            .documents
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(StoredAnnotation {
            id: id.clone(),
            document: document.clone(),
            version: Some(Self::etag(*version)),
        })
    }

    async fn exists(&self, id: &AnnotationId) -> ExistenceCheck {
        if let Err(e) = self.enter(MockOp::Exists, Some(id)) {
            return ExistenceCheck::missing(e.status(), e.to_string());
        }
        let state = self.lock();
        if state.primaries.contains(id) || state.documents.contains_key(id) {
            ExistenceCheck::found(200)
        } else {
            ExistenceCheck::missing(Some(404), "HTTP 404 Not Found")
        }
    }

    async fn create(&self, document: &JsonValue) -> Result<StoredAnnotation> {
        self.enter(MockOp::Create, None)?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = self.canonical(&format!("created-{}", state.next_id));
        let mut stored = document.clone();
        if let Some(obj) = stored.as_object_mut() {
            obj.insert("id".to_string(), json!(id.to_string()));
        }
        state.documents.insert(id.clone(), (stored.clone(), 1));
        Ok(StoredAnnotation {
            id,
            document: stored,
            version: Some(Self::etag(1)),
        })
    }

    async fn update(
        &self,
        id: &AnnotationId,
        document: &JsonValue,
        version: &VersionToken,
    ) -> Result<StoredAnnotation> {
        self.enter(MockOp::Update, Some(id))?;
        let mut state = self.lock();
        let next = Self::check_version(&state, id, version)? + 1;
        let mut stored = document.clone();
        if let Some(obj) = stored.as_object_mut() {
            obj.insert("id".to_string(), json!(id.to_string()));
        }
        state.documents.insert(id.clone(), (stored.clone(), next));
        Ok(StoredAnnotation {
            id: id.clone(),
            document: stored,
            version: Some(Self::etag(next)),
        })
    }

    async fn delete(&self, id: &AnnotationId, version: &VersionToken) -> Result<()> {
        self.enter(MockOp::Delete, Some(id))?;
        let mut state = self.lock();
        Self::check_version(&state, id, version)?;
        state.documents.remove(id);
        Ok(())
    }

    async fn query_by_target(
        &self,
        target: &AnnotationId,
        motivation: &str,
    ) -> Result<Vec<StoredAnnotation>> {
        self.enter(MockOp::Query, Some(target))?;
        let state = self.lock();
        Ok(state
            .documents
            .iter()
            .filter(|(_, (doc, _))| has_motivation_or_purpose(doc, motivation))
            .filter(|(_, (doc, _))| {
                raw_targets(doc)
                    .iter()
                    .any(|raw| self.canonical(raw) == *target)
            })
            .map(|(id, (doc, _))| StoredAnnotation {
                id: id.clone(),
                document: doc.clone(),
                version: None,
            })
            .collect())
    }

    async fn list_page(&self, page: u32) -> Result<ListingPage> {
        self.enter(MockOp::List, None)?;
        let state = self.lock();
        let start = page as usize * self.page_size;
        let items: Vec<StoredAnnotation> = state
            .documents
            .iter()
            .skip(start)
            .take(self.page_size)
            .map(|(id, (doc, _))| StoredAnnotation {
                id: id.clone(),
                document: doc.clone(),
                version: None,
            })
            .collect();
        let has_next = start + items.len() < state.documents.len();
        Ok(ListingPage { items, has_next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new("https://store.example/w3c", "maps")
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = store();
        let id = store.insert_document(json!({"id": "l1", "motivation": "linking"}));
        let read = store.get(&id).await.unwrap();
        store.touch(&id);

        let err = store
            .delete(&id, read.version.as_ref().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
        assert!(store.contains(&id));
    }

    #[tokio::test]
    async fn test_query_matches_canonical_targets() {
        let store = store();
        store.insert_document(json!({
            "id": "l1",
            "motivation": "linking",
            "target": ["a", "https://store.example/w3c/maps/b"]
        }));
        let b = store.insert_primary("b");

        let hits = store.query_by_target(&b, "linking").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.query_by_target(&b, "geotagging").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection_per_id() {
        let store = store();
        let a = store.insert_document(json!({"id": "a"}));
        let b = store.insert_document(json!({"id": "b"}));
        store.fail_always_for(MockOp::Get, &a, Error::Timeout("slow".into()));

        assert!(store.get(&a).await.is_err());
        assert!(store.get(&a).await.is_err());
        assert!(store.get(&b).await.is_ok());
        assert_eq!(store.call_count(MockOp::Get), 3);
    }

    #[tokio::test]
    async fn test_listing_pages() {
        let store = store().with_page_size(2);
        for i in 0..3 {
            store.insert_document(json!({"id": format!("x{}", i)}));
        }
        let first = store.list_page(0).await.unwrap();
        let second = store.list_page(1).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_next);
        assert_eq!(second.items.len(), 1);
        assert!(!second.has_next);
    }
}
