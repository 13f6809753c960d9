//! Orphaned-target audit and repair.
//!
//! Maintenance pass, not part of the write path: every target of a linking
//! annotation gets an existence probe, missing ones are stripped, and records
//! left with fewer than two valid targets are deleted.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use annolink_core::{
    defaults, AnnotationId, AnnotationStore, BatchResult, Error, LinkingAnnotation, Result,
};

use crate::cache::AnnotationCache;
use crate::normalizer::normalize_stored;
use crate::persist::{list_linking, persist_delete, persist_update, read_fresh};

/// Existence probe result for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetCheck {
    pub target: AnnotationId,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanedTargetAnalysis {
    pub annotation_id: Option<AnnotationId>,
    pub valid_targets: Vec<AnnotationId>,
    pub orphaned_targets: Vec<AnnotationId>,
    pub details: Vec<TargetCheck>,
}

impl OrphanedTargetAnalysis {
    pub fn has_orphans(&self) -> bool {
        !self.orphaned_targets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OrphanRepairOutcome {
    /// Every target exists.
    Intact { annotation_id: AnnotationId },
    Repaired {
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
    /// The record disappeared between audit and repair.
    Vanished { annotation_id: AnnotationId },
}

/// Rewrite `annotation` to its valid targets and bump `modified`.
pub fn repair(
    annotation: &LinkingAnnotation,
    analysis: &OrphanedTargetAnalysis,
) -> LinkingAnnotation {
    let orphaned: BTreeSet<&AnnotationId> = analysis.orphaned_targets.iter().collect();
    let mut repaired = annotation.clone();
    repaired.targets.retain(|t| !orphaned.contains(t));
    repaired.modified = Utc::now();
    repaired
}

/// Fewer than two valid targets means the record goes.
pub fn should_delete(analysis: &OrphanedTargetAnalysis) -> bool {
    analysis.valid_targets.len() < 2
}

pub struct OrphanAuditor<S> {
    store: Arc<S>,
    cache: AnnotationCache,
    delay: Duration,
}

impl<S: AnnotationStore + 'static> OrphanAuditor<S> {
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

    /// Probe every target of `annotation`, one at a time.
    #[instrument(skip(self, annotation), fields(subsystem = "engine", component = "orphans", op = "audit", annotation_id = %annotation.display_id()))]
    pub async fn audit(&self, annotation: &LinkingAnnotation) -> OrphanedTargetAnalysis {
        let mut valid_targets = Vec::new();
        let mut orphaned_targets = Vec::new();
        let mut details = Vec::with_capacity(annotation.targets.len());

        for target in &annotation.targets {
            let check = self.store.exists(target).await;
            trace!(target_id = %target, exists = check.exists, "Target checked");
            if check.exists {
                valid_targets.push(target.clone());
            } else {
                orphaned_targets.push(target.clone());
            }
            details.push(TargetCheck {
                target: target.clone(),
                exists: check.exists,
                status: check.status,
                reason: check.reason,
            });
        }

        if !orphaned_targets.is_empty() {
            debug!(
                orphan_count = orphaned_targets.len(),
                valid_count = valid_targets.len(),
                "Orphaned targets found"
            );
        }
        OrphanedTargetAnalysis {
            annotation_id: annotation.id.clone(),
            valid_targets,
            orphaned_targets,
            details,
        }
    }

    /// Audit `annotation` and persist the repair, if one is needed.
    pub async fn audit_and_repair(
        &self,
        annotation: &LinkingAnnotation,
    ) -> Result<OrphanRepairOutcome> {
        let id = annotation.id.clone().ok_or_else(|| {
            Error::InvalidInput("cannot repair an annotation without id".to_string())
        })?;
        let analysis = self.audit(annotation).await;
        if !analysis.has_orphans() {
            return Ok(OrphanRepairOutcome::Intact { annotation_id: id });
        }

        let fresh = match read_fresh(self.store.as_ref(), &id).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => {
                return Ok(OrphanRepairOutcome::Vanished { annotation_id: id })
            }
            Err(e) => return Err(e),
        };

        let mut repaired = repair(&fresh.annotation, &analysis);
        repaired.id = Some(id.clone());
        if should_delete(&analysis) || repaired.targets.len() < 2 {
            persist_delete(
                self.store.as_ref(),
                &self.cache,
                &id,
                &fresh.version,
                &fresh.annotation.targets,
            )
            .await?;
            info!(annotation_id = %id, removed = analysis.orphaned_targets.len(), "Orphaned linking annotation deleted");
            return Ok(OrphanRepairOutcome::Deleted {
                annotation_id: id,
                removed: analysis.orphaned_targets,
            });
        }

        persist_update(
            self.store.as_ref(),
            &self.cache,
            &repaired,
            &fresh.version,
            &fresh.annotation.targets,
        )
        .await?;
        info!(annotation_id = %id, removed = analysis.orphaned_targets.len(), "Orphaned targets stripped");
        Ok(OrphanRepairOutcome::Repaired {
            annotation_id: id,
            removed: analysis.orphaned_targets,
            remaining: repaired.targets,
            dropped: fresh.dropped,
        })
    }

    /// Audit and repair every linking annotation in the container.
    #[instrument(skip(self), fields(subsystem = "engine", component = "orphans", op = "audit_all"))]
    pub async fn audit_all(&self) -> Result<BatchResult<OrphanRepairOutcome>> {
        let records = list_linking(self.store.as_ref()).await?;
        let mut result = BatchResult::new();

        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.delay).await;
            }
            let outcome = match normalize_stored(record, self.store.canonicalizer()) {
                Ok(normalized) => self.audit_and_repair(&normalized.annotation).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                warn!(annotation_id = %record.id, error = %e, "Orphan repair failed");
            }
            result.record(record.id.clone(), outcome);
        }

        info!(
            result_count = result.succeeded.len(),
            failure_count = result.failed.len(),
            "Orphan audit complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AnnotationId {
        AnnotationId::new(format!("https://store.example/w3c/maps/{}", s))
    }

    fn analysis(valid: &[&str], orphaned: &[&str]) -> OrphanedTargetAnalysis {
        OrphanedTargetAnalysis {
            annotation_id: Some(id("l1")),
            valid_targets: valid.iter().map(|s| id(s)).collect(),
            orphaned_targets: orphaned.iter().map(|s| id(s)).collect(),
            details: Vec::new(),
        }
    }

    #[test]
    fn test_repair_keeps_valid_targets_in_order() {
        let ann = LinkingAnnotation::new(vec![id("c"), id("a"), id("b")], vec![])
            .with_created(Utc::now() - chrono::Duration::hours(1));
        let before = ann.modified;
        let repaired = repair(&ann, &analysis(&["c", "b"], &["a"]));

        assert_eq!(repaired.targets, vec![id("c"), id("b")]);
        assert!(repaired.modified > before);
    }

    #[test]
    fn test_should_delete_below_two_valid() {
        assert!(should_delete(&analysis(&["a"], &["b"])));
        assert!(should_delete(&analysis(&[], &["a", "b"])));
        assert!(!should_delete(&analysis(&["a", "b"], &["c"])));
    }
}
