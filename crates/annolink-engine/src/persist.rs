//! Read-before-write helpers shared by every write path.
//!
//! Writes always carry the version token of a read issued immediately before
//! them, go through the structural invariants, and invalidate every cache
//! scope that depends on the touched ids before returning.

use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use tracing::{debug, instrument, trace, warn};

use annolink_core::{
    defaults, AnnotationId, AnnotationStore, Error, LinkingAnnotation, Result, StoredAnnotation,
    VersionToken,
};

use crate::cache::AnnotationCache;
use crate::normalizer::normalize_stored;

/// A normalized record together with the token needed to write it.
#[derive(Debug, Clone)]
pub struct FreshRecord {
    pub annotation: LinkingAnnotation,
    pub version: VersionToken,
    pub issues: Vec<String>,
    /// Body entries the stored document held that the repaired form omits.
    /// Writing the record removes them from the store.
    pub dropped: Vec<JsonValue>,
}

/// Read `id` and normalize it.
#[instrument(skip(store), fields(subsystem = "engine", component = "persist", op = "read_fresh", annotation_id = %id))]
pub async fn read_fresh<S: AnnotationStore + ?Sized>(
    store: &S,
    id: &AnnotationId,
) -> Result<FreshRecord> {
    let stored = store.get(id).await?;
    let version = stored.require_version()?.clone();
    let normalized = normalize_stored(&stored, store.canonicalizer())?;
    if normalized.needs_repair {
        debug!(issue_count = normalized.issues.len(), "Record will be written in repaired form");
    }
    if !normalized.dropped.is_empty() {
        warn!(
            dropped = normalized.dropped.len(),
            issues = ?normalized.issues,
            "Superseded body entries will not be written back"
        );
    }
    Ok(FreshRecord {
        annotation: normalized.annotation,
        version,
        issues: normalized.issues,
        dropped: normalized.dropped,
    })
}

/// Ids whose cache scopes a write affects.
fn touched(annotation: &LinkingAnnotation, previous_targets: &[AnnotationId]) -> Vec<AnnotationId> {
    let mut ids: BTreeSet<AnnotationId> = annotation.targets.iter().cloned().collect();
    ids.extend(previous_targets.iter().cloned());
    if let Some(id) = &annotation.id {
        ids.insert(id.clone());
    }
    ids.into_iter().collect()
}

/// Write `annotation` over its stored version.
pub async fn persist_update<S: AnnotationStore + ?Sized>(
    store: &S,
    cache: &AnnotationCache,
    annotation: &LinkingAnnotation,
    version: &VersionToken,
    previous_targets: &[AnnotationId],
) -> Result<StoredAnnotation> {
    annotation.check_invariants()?;
    let id = annotation
        .id
        .as_ref()
        .ok_or_else(|| Error::InvalidInput("cannot update an annotation without id".into()))?;
    let document = annotation.to_document()?;
    let stored = store.update(id, &document, version).await?;
    let cleared = cache.invalidate_for_ids(&touched(annotation, previous_targets));
    trace!(annotation_id = %id, cleared, "Cache scopes invalidated after update");
    Ok(stored)
}

/// Create `annotation` as a new record.
pub async fn persist_create<S: AnnotationStore + ?Sized>(
    store: &S,
    cache: &AnnotationCache,
    annotation: &LinkingAnnotation,
) -> Result<StoredAnnotation> {
    annotation.check_invariants()?;
    let document = annotation.to_document()?;
    let stored = store.create(&document).await?;
    let mut ids = touched(annotation, &[]);
    ids.push(stored.id.clone());
    cache.invalidate_for_ids(&ids);
    Ok(stored)
}

/// Delete `id` at `version`.
pub async fn persist_delete<S: AnnotationStore + ?Sized>(
    store: &S,
    cache: &AnnotationCache,
    id: &AnnotationId,
    version: &VersionToken,
    targets: &[AnnotationId],
) -> Result<()> {
    store.delete(id, version).await?;
    let mut ids = targets.to_vec();
    ids.push(id.clone());
    cache.invalidate_for_ids(&ids);
    Ok(())
}

/// Every linking (and legacy geotagging) record in the container, following
/// the paged listing. A failing page aborts the read.
#[instrument(skip(store), fields(subsystem = "engine", component = "persist", op = "list_linking"))]
pub async fn list_linking<S: AnnotationStore + ?Sized>(store: &S) -> Result<Vec<StoredAnnotation>> {
    let mut records = Vec::new();
    let mut page = 0u32;
    loop {
        let listing = store.list_page(page).await?;
        trace!(page, result_count = listing.items.len(), "Listing page");
        let exhausted = listing.items.is_empty() || !listing.has_next;
        records.extend(listing.items.into_iter().filter(StoredAnnotation::is_linking));
        if exhausted {
            break;
        }
        page += 1;
        if page >= defaults::MAX_LISTING_PAGES {
            warn!(page, "Listing page cap reached, stopping");
            break;
        }
    }
    debug!(result_count = records.len(), "Linking annotations listed");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AnnotationCache, CacheConfig};
    use annolink_core::{BodyEntry, PointSelection};
    use annolink_store::mock::{InMemoryStore, MockOp};
    use serde_json::json;

    fn store() -> InMemoryStore {
        InMemoryStore::new("https://store.example/w3c", "maps").with_page_size(2)
    }

    #[tokio::test]
    async fn test_list_linking_follows_pages_and_filters() {
        let store = store();
        for i in 0..3 {
            store.insert_document(json!({"id": format!("l{}", i), "motivation": "linking", "target": ["a", "b"]}));
        }
        store.insert_document(json!({"id": "g0", "motivation": "geotagging", "target": "a"}));
        store.insert_document(json!({"id": "p0", "motivation": "textspotting", "target": "c"}));

        let records = list_linking(&store).await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(store.call_count(MockOp::List), 3);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_annotation() {
        let store = store();
        let cache = AnnotationCache::new(CacheConfig::default());
        let id = store.insert_document(json!({"id": "l1", "motivation": "linking", "target": ["a", "b"]}));
        let fresh = read_fresh(&store, &id).await.unwrap();

        let mut broken = fresh.annotation.clone();
        broken.targets.truncate(1);
        let err = persist_update(&store, &cache, &broken, &fresh.version, &[])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidAnnotation(_)));
        assert_eq!(store.call_count(MockOp::Update), 0);

        broken.body.push(BodyEntry::Selecting(PointSelection::at(1.0, 1.0)));
        let stored = persist_update(&store, &cache, &broken, &fresh.version, &[])
            .await
            .unwrap();
        assert!(stored.document["target"].is_string());
    }

    #[tokio::test]
    async fn test_read_fresh_reports_superseded_points() {
        let store = store();
        let id = store.insert_document(json!({
            "id": "l1",
            "motivation": "linking",
            "target": ["a", "b"],
            "body": [
                {"purpose": "selecting", "type": "SpecificResource",
                 "selector": {"type": "PointSelector", "x": 1, "y": 1}},
                {"purpose": "selecting", "type": "SpecificResource",
                 "selector": {"type": "PointSelector", "x": 2, "y": 2}}
            ]
        }));

        let fresh = read_fresh(&store, &id).await.unwrap();

        assert_eq!(fresh.dropped.len(), 1);
        assert_eq!(fresh.dropped[0]["selector"]["x"], 1);
        assert!(!fresh.issues.is_empty());
        assert_eq!(fresh.annotation.point_selection().unwrap().selector.x, 2.0);
    }
}
