//! Conflict and mergeability analysis for proposed links.
//!
//! Given the targets a caller wants to link, finds every existing linking
//! annotation touching any of them and classifies each one:
//!
//! - **mergeable** when all of its targets are part of the proposal and no
//!   point or geotag content is contributed by both sides
//! - **conflict** otherwise, tagged with the content type that collides
//!   (`linking` when the existing record also links a target outside the
//!   proposal)

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use annolink_core::{
    defaults, AnnotationId, AnnotationStore, ContentType, LinkingAnnotation, Result,
};

use crate::cache::{target_scope, AnnotationCache, CacheRead};
use crate::normalizer::normalize_stored;

/// A link a caller wants to create or extend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkProposal {
    pub target_ids: Vec<AnnotationId>,
    /// Content the new link brings.
    pub contributes: BTreeSet<ContentType>,
    /// Linking annotation being edited, ignored during analysis.
    pub exclude: Option<AnnotationId>,
}

impl LinkProposal {
    /// Plain grouping of `target_ids`.
    pub fn new(target_ids: Vec<AnnotationId>) -> Self {
        let mut contributes = BTreeSet::new();
        if target_ids.len() > 1 {
            contributes.insert(ContentType::Linking);
        }
        Self {
            target_ids,
            contributes,
            exclude: None,
        }
    }

    /// Proposal equivalent to writing `annotation`.
    pub fn for_annotation(annotation: &LinkingAnnotation) -> Self {
        Self {
            target_ids: annotation.targets.clone(),
            contributes: annotation.content_types(),
            exclude: annotation.id.clone(),
        }
    }

    pub fn contributing(mut self, content: ContentType) -> Self {
        self.contributes.insert(content);
        self
    }

    pub fn excluding(mut self, id: Option<AnnotationId>) -> Self {
        self.exclude = id;
        self
    }
}

/// An existing annotation the proposal would collide with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkConflict {
    pub annotation_id: AnnotationId,
    pub conflict_type: ContentType,
    /// Proposal targets the existing annotation already links.
    pub shared_targets: Vec<AnnotationId>,
    /// Targets of the existing annotation outside the proposal.
    pub foreign_targets: Vec<AnnotationId>,
    pub existing_content: BTreeSet<ContentType>,
    pub message: String,
}

/// An existing annotation the proposal can be merged into.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeCandidate {
    pub annotation_id: AnnotationId,
    pub shared_targets: Vec<AnnotationId>,
    pub existing_content: BTreeSet<ContentType>,
    /// Content the merge would add to the existing annotation.
    pub adds: BTreeSet<ContentType>,
}

/// Outcome of analyzing a proposal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConflictReport {
    pub is_valid: bool,
    pub conflicts: Vec<LinkConflict>,
    pub mergeable: Vec<MergeCandidate>,
    pub warnings: Vec<String>,
}

/// How one existing annotation relates to a proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    Mergeable(MergeCandidate),
    Conflict(LinkConflict),
}

/// Classify `existing` against `proposal`. `existing.id` must be set.
pub fn classify_existing(
    proposal: &LinkProposal,
    existing_id: &AnnotationId,
    existing: &LinkingAnnotation,
) -> Relation {
    let candidates: BTreeSet<&AnnotationId> = proposal.target_ids.iter().collect();
    let (shared_targets, foreign_targets): (Vec<AnnotationId>, Vec<AnnotationId>) = existing
        .targets
        .iter()
        .cloned()
        .partition(|t| candidates.contains(t));
    let existing_content = existing.content_types();

    if !foreign_targets.is_empty() {
        let message = format!(
            "{} already links {} to {} outside this request",
            existing_id,
            join(&shared_targets),
            join(&foreign_targets)
        );
        return Relation::Conflict(LinkConflict {
            annotation_id: existing_id.clone(),
            conflict_type: ContentType::Linking,
            shared_targets,
            foreign_targets,
            existing_content,
            message,
        });
    }

    let collision = proposal
        .contributes
        .iter()
        .filter(|c| c.is_enhancement())
        .find(|c| existing_content.contains(*c));
    if let Some(&collision) = collision {
        return Relation::Conflict(LinkConflict {
            annotation_id: existing_id.clone(),
            conflict_type: collision,
            message: format!("{} already carries {} content", existing_id, collision),
            shared_targets,
            foreign_targets,
            existing_content,
        });
    }

    let adds = proposal
        .contributes
        .difference(&existing_content)
        .copied()
        .collect();
    Relation::Mergeable(MergeCandidate {
        annotation_id: existing_id.clone(),
        shared_targets,
        existing_content,
        adds,
    })
}

fn join(ids: &[AnnotationId]) -> String {
    ids.iter()
        .map(|id| id.slug())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build a report from already-fetched annotations.
pub fn build_report(
    proposal: &LinkProposal,
    existing: &[LinkingAnnotation],
    mut warnings: Vec<String>,
) -> ConflictReport {
    let mut conflicts = Vec::new();
    let mut mergeable = Vec::new();
    let mut seen = BTreeSet::new();

    for annotation in existing {
        let Some(id) = annotation.id.as_ref() else {
            continue;
        };
        if Some(id) == proposal.exclude.as_ref() || !seen.insert(id.clone()) {
            continue;
        }
        match classify_existing(proposal, id, annotation) {
            Relation::Mergeable(m) => mergeable.push(m),
            Relation::Conflict(c) => conflicts.push(c),
        }
    }

    if !mergeable.is_empty() {
        warnings.push(format!(
            "{} existing linking annotation(s) can be merged with this link",
            mergeable.len()
        ));
    }

    ConflictReport {
        is_valid: conflicts.is_empty(),
        conflicts,
        mergeable,
        warnings,
    }
}

/// Store-backed analyzer; lookups go through the shared cache.
pub struct ConflictAnalyzer<S> {
    store: Arc<S>,
    cache: AnnotationCache,
}

impl<S: AnnotationStore + 'static> ConflictAnalyzer<S> {
    pub fn new(store: Arc<S>, cache: AnnotationCache) -> Self {
        Self { store, cache }
    }

    /// Analyze a plain grouping of `candidate_ids`.
    pub async fn analyze(
        &self,
        candidate_ids: &[AnnotationId],
        exclude: Option<&AnnotationId>,
    ) -> Result<ConflictReport> {
        let proposal = LinkProposal::new(candidate_ids.to_vec()).excluding(exclude.cloned());
        self.analyze_proposal(&proposal).await
    }

    #[instrument(skip(self, proposal), fields(subsystem = "engine", component = "conflicts", op = "analyze", target_count = proposal.target_ids.len()))]
    pub async fn analyze_proposal(&self, proposal: &LinkProposal) -> Result<ConflictReport> {
        let mut existing = Vec::new();
        let mut warnings = Vec::new();

        for target in &proposal.target_ids {
            for motivation in [
                defaults::LINKING_MOTIVATION,
                defaults::LEGACY_GEOTAGGING_MOTIVATION,
            ] {
                let store = Arc::clone(&self.store);
                let query_target = target.clone();
                let read = self
                    .cache
                    .get(
                        &target_scope(target, motivation),
                        std::slice::from_ref(target),
                        move || async move { store.query_by_target(&query_target, motivation).await },
                    )
                    .await?;

                let records = match read {
                    CacheRead::Fresh(records) => records,
                    CacheRead::Stale(records) => {
                        warnings.push(format!(
                            "{} lookup for {} served from stale cache",
                            motivation, target
                        ));
                        records
                    }
                    CacheRead::Empty => {
                        warn!(target_id = %target, motivation, "Lookup skipped, circuit open");
                        warnings.push(format!(
                            "{} lookup for {} skipped: store circuit open",
                            motivation, target
                        ));
                        Vec::new()
                    }
                };

                for record in &records {
                    match normalize_stored(record, self.store.canonicalizer()) {
                        Ok(normalized) => existing.push(normalized.annotation),
                        Err(e) => warnings.push(format!("{} ignored: {}", record.id, e)),
                    }
                }
            }
        }

        let report = build_report(proposal, &existing, warnings);
        debug!(
            is_valid = report.is_valid,
            conflict_count = report.conflicts.len(),
            mergeable_count = report.mergeable.len(),
            "Link analysis complete"
        );
        Ok(report)
    }
}
