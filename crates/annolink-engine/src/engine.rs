//! The engine facade used by editors, deletion flows and maintenance jobs.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use annolink_core::{
    defaults, AnnotationId, AnnotationStore, BatchResult, ContentType, Error, LinkingAnnotation,
    Result, StoredAnnotation,
};

use crate::cache::{canvas_scope, AnnotationCache};
use crate::cascade::{CascadeCoordinator, CascadeResult};
use crate::config::EngineConfig;
use crate::conflict::{ConflictAnalyzer, ConflictReport, LinkProposal, MergeCandidate};
use crate::duplicates::{
    detect, merge, superseded_bodies, ConsolidationOutcome, Consolidator, DuplicateVerdict,
    MergeStrategy,
};
use crate::normalizer::normalize_stored;
use crate::orphans::{OrphanAuditor, OrphanRepairOutcome, OrphanedTargetAnalysis};
use crate::persist::{persist_create, persist_delete, persist_update, read_fresh, FreshRecord};

/// How a link request was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkAction {
    Created,
    /// Folded into an existing compatible annotation.
    Merged,
    /// The caller's own annotation, rewritten.
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkOutcome {
    pub annotation_id: AnnotationId,
    pub action: LinkAction,
    pub warnings: Vec<String>,
    /// Compatible annotations folded into `annotation_id` and deleted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub absorbed: Vec<AnnotationId>,
    /// Superseded body entries not written back.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<JsonValue>,
}

/// Linking annotations visible on one canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasLinks {
    pub annotations: Vec<LinkingAnnotation>,
    /// Some lookups were served stale or skipped.
    pub degraded: bool,
}

/// Consistency engine over an [`AnnotationStore`].
///
/// One instance owns the bulk cache; clone the `Arc` around it rather than
/// building a second engine for the same store.
pub struct LinkingEngine<S> {
    store: Arc<S>,
    cache: AnnotationCache,
    config: EngineConfig,
    analyzer: ConflictAnalyzer<S>,
    consolidator: Consolidator<S>,
    cascade: CascadeCoordinator<S>,
    orphans: OrphanAuditor<S>,
    run_id: Uuid,
}

impl<S: AnnotationStore + 'static> LinkingEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self::with_shared_store(Arc::new(store), config)
    }

    pub fn with_shared_store(store: Arc<S>, config: EngineConfig) -> Self {
        let cache = AnnotationCache::new(config.cache.clone());
        let run_id = Uuid::now_v7();
        info!(
            run_id = %run_id,
            base_url = store.canonicalizer().base_url(),
            container = store.canonicalizer().container(),
            "Linking engine initialized"
        );
        Self {
            analyzer: ConflictAnalyzer::new(Arc::clone(&store), cache.clone()),
            consolidator: Consolidator::new(
                Arc::clone(&store),
                cache.clone(),
                config.duplicates.clone(),
            )
            .with_delay(config.batch_delay),
            cascade: CascadeCoordinator::new(Arc::clone(&store), cache.clone())
                .with_delay(config.batch_delay),
            orphans: OrphanAuditor::new(Arc::clone(&store), cache.clone())
                .with_delay(config.batch_delay),
            store,
            cache,
            config,
            run_id,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &AnnotationCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Correlation id of this engine instance, attached to maintenance logs.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Canonicalize raw ids as accepted from callers.
    pub fn canonical_ids<I, T>(&self, raw: I) -> Vec<AnnotationId>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.store.canonicalizer().canonicalize_all(raw)
    }

    // -------------------------------------------------------------------------
    // Link analysis
    // -------------------------------------------------------------------------

    /// Check whether grouping `candidate_ids` collides with existing links.
    pub async fn validate_linking(
        &self,
        candidate_ids: &[AnnotationId],
        exclude_linking_id: Option<&AnnotationId>,
    ) -> Result<ConflictReport> {
        let candidates = self.canonical_ids(candidate_ids);
        let exclude = exclude_linking_id
            .and_then(|id| self.store.canonicalizer().canonicalize(id.as_str()));
        self.analyzer.analyze(&candidates, exclude.as_ref()).await
    }

    pub async fn analyze_proposal(&self, proposal: &LinkProposal) -> Result<ConflictReport> {
        let mut proposal = proposal.clone();
        proposal.target_ids = self.canonical_ids(&proposal.target_ids);
        self.analyzer.analyze_proposal(&proposal).await
    }

    /// Write a link: update the caller's own record, merge into a compatible
    /// existing one, or create a new one.
    ///
    /// Targets must exist and the link must not conflict with existing
    /// annotations; conflicts fail with [`Error::Conflict`].
    #[instrument(skip(self, annotation), fields(subsystem = "engine", component = "engine", op = "link", run_id = %self.run_id, target_count = annotation.targets.len()))]
    pub async fn link(&self, annotation: LinkingAnnotation) -> Result<LinkOutcome> {
        let mut annotation = annotation;
        annotation.targets = self.canonical_ids(&annotation.targets);
        annotation.check_invariants()?;

        for target in &annotation.targets {
            let check = self.store.exists(target).await;
            if !check.exists {
                return Err(Error::InvalidInput(format!(
                    "target {} does not exist ({})",
                    target,
                    check.reason.unwrap_or_else(|| "unknown reason".to_string())
                )));
            }
        }

        let report = self
            .analyzer
            .analyze_proposal(&LinkProposal::for_annotation(&annotation))
            .await?;
        if !report.is_valid {
            let messages: Vec<&str> = report.conflicts.iter().map(|c| c.message.as_str()).collect();
            return Err(Error::Conflict(messages.join("; ")));
        }
        let warnings = report.warnings;

        if let Some(id) = annotation.id.clone() {
            let fresh = read_fresh(self.store.as_ref(), &id).await?;
            let mut updated = annotation;
            updated.created = fresh.annotation.created;
            updated.creator = fresh.annotation.creator.clone();
            updated.modified = Utc::now();
            persist_update(
                self.store.as_ref(),
                &self.cache,
                &updated,
                &fresh.version,
                &fresh.annotation.targets,
            )
            .await?;
            return Ok(LinkOutcome {
                annotation_id: id,
                action: LinkAction::Updated,
                warnings,
                absorbed: vec![],
                dropped: vec![],
            });
        }

        if !report.mergeable.is_empty() {
            return self
                .fold_into_candidates(annotation, &report.mergeable, warnings)
                .await;
        }

        let created = persist_create(self.store.as_ref(), &self.cache, &annotation).await?;
        info!(annotation_id = %created.id, "Linking annotation created");
        Ok(LinkOutcome {
            annotation_id: created.id,
            action: LinkAction::Created,
            warnings,
            absorbed: vec![],
            dropped: vec![],
        })
    }

    /// Fold the proposal and every compatible candidate into the oldest
    /// candidate, then delete the others.
    ///
    /// The survivor takes the proposal's target order, which covers every
    /// candidate's targets since candidates have no foreign targets.
    async fn fold_into_candidates(
        &self,
        annotation: LinkingAnnotation,
        candidates: &[MergeCandidate],
        mut warnings: Vec<String>,
    ) -> Result<LinkOutcome> {
        let mut records: Vec<(AnnotationId, FreshRecord)> =
            Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match read_fresh(self.store.as_ref(), &candidate.annotation_id).await {
                Ok(fresh) => records.push((candidate.annotation_id.clone(), fresh)),
                Err(e) if e.is_not_found() => {
                    warn!(
                        annotation_id = %candidate.annotation_id,
                        "Merge candidate vanished before merge"
                    );
                    warnings.push(format!(
                        "{} was deleted before it could be merged",
                        candidate.annotation_id
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        if records.is_empty() {
            let created = persist_create(self.store.as_ref(), &self.cache, &annotation).await?;
            info!(annotation_id = %created.id, "Linking annotation created");
            return Ok(LinkOutcome {
                annotation_id: created.id,
                action: LinkAction::Created,
                warnings,
                absorbed: vec![],
                dropped: vec![],
            });
        }

        check_enhancement_collisions(&annotation, &records)?;

        records.sort_by(|(a_id, a), (b_id, b)| {
            (a.annotation.created, a_id.as_str()).cmp(&(b.annotation.created, b_id.as_str()))
        });
        let (survivor_id, survivor) = records.remove(0);

        let now = Utc::now();
        let mut merged = survivor.annotation.clone();
        let mut dropped = survivor.dropped.clone();
        for (_, other) in &records {
            dropped.extend(other.dropped.iter().cloned());
            for entry in superseded_bodies(&merged.body, &other.annotation.body) {
                dropped.push(serde_json::to_value(&entry)?);
            }
            merged = merge(&merged, &other.annotation, MergeStrategy::MergeBodies, now);
        }
        for entry in superseded_bodies(&merged.body, &annotation.body) {
            dropped.push(serde_json::to_value(&entry)?);
        }
        let merged = merge(&merged, &annotation, MergeStrategy::PreserveNewerOrder, now);

        persist_update(
            self.store.as_ref(),
            &self.cache,
            &merged,
            &survivor.version,
            &survivor.annotation.targets,
        )
        .await?;

        let mut absorbed = Vec::with_capacity(records.len());
        for (id, fresh) in records {
            match persist_delete(
                self.store.as_ref(),
                &self.cache,
                &id,
                &fresh.version,
                &fresh.annotation.targets,
            )
            .await
            {
                Ok(()) => absorbed.push(id),
                Err(e) if e.is_not_found() => absorbed.push(id),
                Err(e) => return Err(e),
            }
        }

        info!(
            annotation_id = %survivor_id,
            absorbed = absorbed.len(),
            "Link merged into existing annotation"
        );
        Ok(LinkOutcome {
            annotation_id: survivor_id,
            action: LinkAction::Merged,
            warnings,
            absorbed,
            dropped,
        })
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    pub async fn cascade_delete_from_linking(
        &self,
        deleted_ids: &[AnnotationId],
    ) -> Result<CascadeResult> {
        let result = self.cascade.cascade_delete(deleted_ids).await?;
        if !result.outcome.is_complete_success() {
            warn!(
                run_id = %self.run_id,
                failure_count = result.errors().len(),
                "Cascade finished with failures"
            );
        }
        Ok(result)
    }

    pub async fn audit_orphans(&self, annotation: &LinkingAnnotation) -> OrphanedTargetAnalysis {
        self.orphans.audit(annotation).await
    }

    pub async fn audit_and_repair_orphans(
        &self,
        annotation: &LinkingAnnotation,
    ) -> Result<OrphanRepairOutcome> {
        self.orphans.audit_and_repair(annotation).await
    }

    /// Fetch and normalize `id`, then audit and repair it.
    pub async fn audit_and_repair_orphans_by_id(
        &self,
        id: &AnnotationId,
    ) -> Result<OrphanRepairOutcome> {
        let fresh = read_fresh(self.store.as_ref(), id).await?;
        self.orphans.audit_and_repair(&fresh.annotation).await
    }

    pub async fn audit_all_orphans(&self) -> Result<BatchResult<OrphanRepairOutcome>> {
        self.orphans.audit_all().await
    }

    pub fn detect_duplicates(
        &self,
        a: &LinkingAnnotation,
        b: &LinkingAnnotation,
    ) -> DuplicateVerdict {
        detect(a, b, &self.config.duplicates)
    }

    pub async fn consolidate(
        &self,
        a: &AnnotationId,
        b: &AnnotationId,
    ) -> Result<ConsolidationOutcome> {
        self.consolidator.consolidate(a, b).await
    }

    pub async fn consolidate_all(&self) -> Result<BatchResult<ConsolidationOutcome>> {
        self.consolidator.consolidate_all().await
    }

    // -------------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------------

    /// Drop cached data for one scope, or all scopes.
    pub fn invalidate_cache(&self, scope_key: Option<&str>) {
        debug!(scope_key = scope_key.unwrap_or("*"), "Cache invalidated");
        self.cache.invalidate(scope_key);
    }

    /// Linking annotations touching any of `target_ids`, cached per canvas.
    #[instrument(skip(self, target_ids), fields(subsystem = "engine", component = "engine", op = "linking_for_canvas", scope_key = %canvas_scope(canvas)))]
    pub async fn linking_for_canvas(
        &self,
        canvas: &str,
        target_ids: &[AnnotationId],
    ) -> Result<CanvasLinks> {
        let targets = self.canonical_ids(target_ids);
        let store = Arc::clone(&self.store);
        let query_targets = targets.clone();
        let read = self
            .cache
            .get(&canvas_scope(canvas), &targets, move || async move {
                let mut seen = BTreeSet::new();
                let mut records: Vec<StoredAnnotation> = Vec::new();
                for target in &query_targets {
                    for record in store
                        .query_by_target(target, defaults::LINKING_MOTIVATION)
                        .await?
                    {
                        if seen.insert(record.id.clone()) {
                            records.push(record);
                        }
                    }
                }
                Ok(records)
            })
            .await?;

        let degraded = read.is_degraded();
        let annotations = read
            .into_option()
            .unwrap_or_default()
            .iter()
            .filter_map(|record| normalize_stored(record, self.store.canonicalizer()).ok())
            .map(|normalized| normalized.annotation)
            .collect();
        Ok(CanvasLinks {
            annotations,
            degraded,
        })
    }

    /// Content types an annotation would contribute when linked.
    pub fn content_of(&self, annotation: &LinkingAnnotation) -> BTreeSet<ContentType> {
        annotation.content_types()
    }
}

/// Fail when two records that would fold together carry the same
/// enhancement type.
fn check_enhancement_collisions(
    proposal: &LinkingAnnotation,
    records: &[(AnnotationId, FreshRecord)],
) -> Result<()> {
    let mut carriers: BTreeMap<ContentType, String> = proposal
        .content_types()
        .into_iter()
        .filter(ContentType::is_enhancement)
        .map(|c| (c, "this request".to_string()))
        .collect();
    for (id, fresh) in records {
        for content in fresh.annotation.content_types() {
            if !content.is_enhancement() {
                continue;
            }
            if let Some(holder) = carriers.get(&content) {
                return Err(Error::Conflict(format!(
                    "{} and {} both carry {} content",
                    holder, id, content
                )));
            }
            carriers.insert(content, id.to_string());
        }
    }
    Ok(())
}
