//! Cascade of primary-annotation deletions into linking annotations.
//!
//! When primary annotations disappear, every linking annotation that lists
//! them loses those targets. A record left with no targets, or with a single
//! target and no point or geotag, is deleted; anything else is rewritten with
//! the remaining targets.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace};

use annolink_core::{
    defaults, AnnotationId, AnnotationStore, BatchResult, IdCanonicalizer, ItemFailure,
    LinkingAnnotation, Result, StoredAnnotation,
};

use crate::cache::AnnotationCache;
use crate::normalizer::normalize_stored;
use crate::persist::{list_linking, persist_delete, persist_update, read_fresh};

/// What to do with one linking annotation.
#[derive(Debug, Clone, PartialEq)]
pub enum CascadeDecision {
    Unaffected,
    Update {
        new_targets: Vec<AnnotationId>,
        removed: Vec<AnnotationId>,
    },
    Delete {
        removed: Vec<AnnotationId>,
    },
}

/// What the cascade did to one linking annotation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CascadeAction {
    Updated {
        annotation_id: AnnotationId,
        removed: Vec<AnnotationId>,
        remaining: Vec<AnnotationId>,
        /// Superseded body entries not written back.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        dropped: Vec<JsonValue>,
    },
    Deleted {
        annotation_id: AnnotationId,
        removed: Vec<AnnotationId>,
    },
    /// The fresh read no longer referenced a deleted target, or the record
    /// was already gone.
    Unchanged { annotation_id: AnnotationId },
}

impl CascadeAction {
    pub fn annotation_id(&self) -> &AnnotationId {
        match self {
            CascadeAction::Updated { annotation_id, .. }
            | CascadeAction::Deleted { annotation_id, .. }
            | CascadeAction::Unchanged { annotation_id } => annotation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeResult {
    /// Linking annotations that referenced a deleted id at listing time.
    pub affected: Vec<AnnotationId>,
    pub outcome: BatchResult<CascadeAction>,
}

impl CascadeResult {
    pub fn updated(&self) -> Vec<&AnnotationId> {
        self.outcome
            .succeeded
            .iter()
            .filter(|a| matches!(a, CascadeAction::Updated { .. }))
            .map(CascadeAction::annotation_id)
            .collect()
    }

    pub fn deleted(&self) -> Vec<&AnnotationId> {
        self.outcome
            .succeeded
            .iter()
            .filter(|a| matches!(a, CascadeAction::Deleted { .. }))
            .map(CascadeAction::annotation_id)
            .collect()
    }

    pub fn errors(&self) -> &[ItemFailure] {
        &self.outcome.failed
    }
}

/// Whether `target` names one of the `deleted` ids.
///
/// Ids match when canonically equal. When either side lives outside this
/// store's container the last path segment is compared instead, since the
/// same record can be referenced through another base URL.
pub fn matches_deleted(
    target: &AnnotationId,
    deleted: &[AnnotationId],
    ids: &IdCanonicalizer,
) -> bool {
    deleted.iter().any(|d| {
        d == target
            || ((!ids.is_local(target) || !ids.is_local(d)) && d.slug() == target.slug())
    })
}

/// Decide how `annotation` must change once `deleted` are gone.
pub fn decide(
    annotation: &LinkingAnnotation,
    deleted: &[AnnotationId],
    ids: &IdCanonicalizer,
) -> CascadeDecision {
    let (removed, new_targets): (Vec<AnnotationId>, Vec<AnnotationId>) = annotation
        .targets
        .iter()
        .cloned()
        .partition(|t| matches_deleted(t, deleted, ids));

    if removed.is_empty() {
        return CascadeDecision::Unaffected;
    }
    if new_targets.is_empty() || (new_targets.len() == 1 && !annotation.has_enhancement()) {
        return CascadeDecision::Delete { removed };
    }
    CascadeDecision::Update {
        new_targets,
        removed,
    }
}

/// Ids of `records` that reference a deleted id. Records that cannot be
/// normalized are returned as failures rather than skipped.
pub fn select_affected<T>(
    records: &[StoredAnnotation],
    deleted: &[AnnotationId],
    ids: &IdCanonicalizer,
) -> (Vec<AnnotationId>, BatchResult<T>) {
    let mut affected = Vec::new();
    let mut failures = BatchResult::new();
    for record in records {
        match normalize_stored(record, ids) {
            Ok(normalized) => {
                if decide(&normalized.annotation, deleted, ids) != CascadeDecision::Unaffected {
                    affected.push(record.id.clone());
                }
            }
            Err(e) => {
                debug!(annotation_id = %record.id, error = %e, "Record could not be normalized");
                failures.push_failure(record.id.clone(), e);
            }
        }
    }
    (affected, failures)
}

/// Applies deletions of primary annotations to the linking annotations that
/// reference them.
pub struct CascadeCoordinator<S> {
    store: Arc<S>,
    cache: AnnotationCache,
    delay: Duration,
}

impl<S: AnnotationStore + 'static> CascadeCoordinator<S> {
    pub fn new(store: Arc<S>, cache: AnnotationCache) -> Self {
        Self {
            store,
            cache,
            delay: Duration::from_millis(defaults::BATCH_DELAY_MS),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Remove `deleted_ids` from every linking annotation.
    ///
    /// A failing listing aborts the run; failures on individual writes are
    /// collected and the run continues.
    #[instrument(skip(self, deleted_ids), fields(subsystem = "engine", component = "cascade", op = "cascade_delete", target_count = deleted_ids.len()))]
    pub async fn cascade_delete(&self, deleted_ids: &[AnnotationId]) -> Result<CascadeResult> {
        let start = Instant::now();
        let ids = self.store.canonicalizer();
        let deleted = ids.canonicalize_all(deleted_ids.iter().map(AnnotationId::as_str));

        let records = list_linking(self.store.as_ref()).await?;
        let (affected, mut outcome) = select_affected(&records, &deleted, ids);
        debug!(
            scanned = records.len(),
            affected = affected.len(),
            "Cascade candidates selected"
        );

        for (i, id) in affected.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.delay).await;
            }
            let action = self.apply(id, &deleted).await;
            if let Err(e) = &action {
                debug!(annotation_id = %id, error = %e, "Cascade write failed");
            }
            outcome.record(id.clone(), action);
        }
        self.cache.invalidate_for_ids(&deleted);

        let result = CascadeResult { affected, outcome };
        info!(
            updated = result.updated().len(),
            deleted = result.deleted().len(),
            failure_count = result.errors().len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Cascade complete"
        );
        Ok(result)
    }

    /// Re-read one record, re-decide on its current content and write.
    async fn apply(&self, id: &AnnotationId, deleted: &[AnnotationId]) -> Result<CascadeAction> {
        let fresh = match read_fresh(self.store.as_ref(), id).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => {
                return Ok(CascadeAction::Unchanged {
                    annotation_id: id.clone(),
                })
            }
            Err(e) => return Err(e),
        };
        let annotation = fresh.annotation;

        match decide(&annotation, deleted, self.store.canonicalizer()) {
            CascadeDecision::Unaffected => Ok(CascadeAction::Unchanged {
                annotation_id: id.clone(),
            }),
            CascadeDecision::Delete { removed } => {
                persist_delete(
                    self.store.as_ref(),
                    &self.cache,
                    id,
                    &fresh.version,
                    &annotation.targets,
                )
                .await?;
                trace!(annotation_id = %id, "Linking annotation deleted");
                Ok(CascadeAction::Deleted {
                    annotation_id: id.clone(),
                    removed,
                })
            }
            CascadeDecision::Update {
                new_targets,
                removed,
            } => {
                let mut updated = annotation.clone();
                updated.id = Some(id.clone());
                updated.targets = new_targets.clone();
                updated.modified = Utc::now();
                persist_update(
                    self.store.as_ref(),
                    &self.cache,
                    &updated,
                    &fresh.version,
                    &annotation.targets,
                )
                .await?;
                trace!(annotation_id = %id, remaining = new_targets.len(), "Linking annotation updated");
                Ok(CascadeAction::Updated {
                    annotation_id: id.clone(),
                    removed,
                    remaining: new_targets,
                    dropped: fresh.dropped,
                })
            }
        }
    }
}
