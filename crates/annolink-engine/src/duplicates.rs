//! Duplicate detection and consolidation of linking annotations.
//!
//! Two editors linking the same primary annotations at nearly the same time
//! produce two records with the same target set. [`detect`] decides whether
//! such a pair is a duplicate and how to merge it; [`Consolidator`] writes the
//! merged survivor and deletes the other record.
//!
//! Tie-break rules, first match wins:
//! 1. identical target lists: duplicate, bodies merged
//! 2. same set in a different order: duplicate when the newer record was
//!    created within the window and carries a point or geotag, or when both
//!    carry the same point; the newer order is kept
//! 3. anything else: not a duplicate

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use annolink_core::{
    defaults, AnnotationId, AnnotationStore, BatchResult, BodyEntry, LinkingAnnotation, Purpose,
    Result,
};

use crate::cache::AnnotationCache;
use crate::normalizer::normalize_stored;
use crate::persist::{list_linking, persist_delete, persist_update, read_fresh, FreshRecord};

/// Heuristics for deciding whether a reordered pair is a duplicate.
///
/// ## Configuration
///
/// - `ANNOLINK_DUPLICATE_WINDOW_HOURS`: creation-time window (default: 48)
/// - `ANNOLINK_POINT_TOLERANCE`: pixel tolerance for equal points (default: 0)
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicatePolicy {
    pub window: ChronoDuration,
    pub point_tolerance: f64,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            window: ChronoDuration::hours(defaults::DUPLICATE_WINDOW_HOURS),
            point_tolerance: defaults::POINT_TOLERANCE,
        }
    }
}

impl DuplicatePolicy {
    pub fn from_env() -> Self {
        let hours = std::env::var("ANNOLINK_DUPLICATE_WINDOW_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::DUPLICATE_WINDOW_HOURS);
        let tolerance = std::env::var("ANNOLINK_POINT_TOLERANCE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t >= 0.0)
            .unwrap_or(defaults::POINT_TOLERANCE);
        Self {
            window: ChronoDuration::hours(hours),
            point_tolerance: tolerance,
        }
    }

    pub fn with_window(mut self, window: ChronoDuration) -> Self {
        self.window = window;
        self
    }

    pub fn with_point_tolerance(mut self, tolerance: f64) -> Self {
        self.point_tolerance = tolerance;
        self
    }
}

/// How the target lists of two annotations relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRelation {
    /// Both records are the same store record.
    SameRecord,
    Identical,
    SameSetReordered,
    Distinct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the older record's target order.
    MergeBodies,
    /// Adopt the newer record's target order.
    PreserveNewerOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateVerdict {
    pub is_duplicate: bool,
    pub relation: TargetRelation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MergeStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl DuplicateVerdict {
    fn duplicate(relation: TargetRelation, strategy: MergeStrategy) -> Self {
        Self {
            is_duplicate: true,
            relation,
            strategy: Some(strategy),
            warning: None,
        }
    }

    fn distinct(relation: TargetRelation, warning: Option<String>) -> Self {
        Self {
            is_duplicate: false,
            relation,
            strategy: None,
            warning,
        }
    }
}

/// Order two annotations by creation time; ties fall back to the id.
pub fn order_by_age<'a>(
    a: &'a LinkingAnnotation,
    b: &'a LinkingAnnotation,
) -> (&'a LinkingAnnotation, &'a LinkingAnnotation) {
    let a_first = (a.created, a.id.as_ref().map(AnnotationId::as_str))
        <= (b.created, b.id.as_ref().map(AnnotationId::as_str));
    if a_first {
        (a, b)
    } else {
        (b, a)
    }
}

/// Decide whether `a` and `b` are duplicates.
pub fn detect(
    a: &LinkingAnnotation,
    b: &LinkingAnnotation,
    policy: &DuplicatePolicy,
) -> DuplicateVerdict {
    if a.id.is_some() && a.id == b.id {
        return DuplicateVerdict::distinct(TargetRelation::SameRecord, None);
    }
    if a.targets == b.targets {
        return DuplicateVerdict::duplicate(TargetRelation::Identical, MergeStrategy::MergeBodies);
    }
    if a.target_set() != b.target_set() {
        return DuplicateVerdict::distinct(TargetRelation::Distinct, None);
    }

    let (older, newer) = order_by_age(a, b);
    let elapsed = newer.created - older.created;
    if elapsed < policy.window && newer.has_enhancement() {
        return DuplicateVerdict::duplicate(
            TargetRelation::SameSetReordered,
            MergeStrategy::PreserveNewerOrder,
        );
    }
    if let (Some(p), Some(q)) = (older.point_selection(), newer.point_selection()) {
        if p.same_point(q, policy.point_tolerance) {
            return DuplicateVerdict::duplicate(
                TargetRelation::SameSetReordered,
                MergeStrategy::PreserveNewerOrder,
            );
        }
    }

    DuplicateVerdict::distinct(
        TargetRelation::SameSetReordered,
        Some(format!(
            "{} and {} link the same targets in a different order; treated as independent readings",
            older.display_id(),
            newer.display_id()
        )),
    )
}

/// Union two bodies by purpose; the newer entry wins on collision.
pub fn merge_bodies(older: &[BodyEntry], newer: &[BodyEntry]) -> Vec<BodyEntry> {
    let newer_purposes: BTreeSet<Purpose> = newer.iter().map(BodyEntry::purpose).collect();
    older
        .iter()
        .filter(|entry| !newer_purposes.contains(&entry.purpose()))
        .chain(newer.iter())
        .cloned()
        .collect()
}

/// Entries of `older` that [`merge_bodies`] replaces with a newer entry of
/// the same purpose.
pub fn superseded_bodies(older: &[BodyEntry], newer: &[BodyEntry]) -> Vec<BodyEntry> {
    let newer_purposes: BTreeSet<Purpose> = newer.iter().map(BodyEntry::purpose).collect();
    older
        .iter()
        .filter(|entry| newer_purposes.contains(&entry.purpose()))
        .cloned()
        .collect()
}

/// Merge a duplicate pair into the record that survives.
///
/// The survivor keeps the older id, `created` and creator; `modified` is set
/// to `now`.
pub fn merge(
    older: &LinkingAnnotation,
    newer: &LinkingAnnotation,
    strategy: MergeStrategy,
    now: DateTime<Utc>,
) -> LinkingAnnotation {
    let mut merged = older.clone();
    if strategy == MergeStrategy::PreserveNewerOrder {
        merged.targets = newer.targets.clone();
    }
    merged.body = merge_bodies(&older.body, &newer.body);
    for entry in &newer.unclassified_body {
        if !merged.unclassified_body.contains(entry) {
            merged.unclassified_body.push(entry.clone());
        }
    }
    for (key, value) in &newer.extra {
        merged
            .extra
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    merged.modified = now;
    merged
}

/// A duplicate pair found by [`scan_duplicates`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePair {
    pub survivor: AnnotationId,
    pub duplicate: AnnotationId,
    pub verdict: DuplicateVerdict,
}

/// Find duplicate pairs among `annotations`, pairing each group's oldest
/// record with every later one.
pub fn scan_duplicates(
    annotations: &[LinkingAnnotation],
    policy: &DuplicatePolicy,
) -> Vec<DuplicatePair> {
    let mut groups: BTreeMap<Vec<&AnnotationId>, Vec<&LinkingAnnotation>> = BTreeMap::new();
    for annotation in annotations.iter().filter(|a| a.id.is_some()) {
        let key: Vec<&AnnotationId> = annotation.target_set().into_iter().collect();
        groups.entry(key).or_default().push(annotation);
    }

    let mut pairs = Vec::new();
    for (_, mut group) in groups {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| {
            (a.created, a.id.as_ref()).cmp(&(b.created, b.id.as_ref()))
        });
        let oldest = group[0];
        for candidate in &group[1..] {
            let verdict = detect(oldest, candidate, policy);
            if !verdict.is_duplicate {
                if let Some(warning) = &verdict.warning {
                    debug!(warning = %warning, "Reordered pair left alone");
                }
                continue;
            }
            if let (Some(survivor), Some(duplicate)) = (&oldest.id, &candidate.id) {
                pairs.push(DuplicatePair {
                    survivor: survivor.clone(),
                    duplicate: duplicate.clone(),
                    verdict,
                });
            }
        }
    }
    pairs
}

/// What consolidating a pair did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    Merged {
        survivor: AnnotationId,
        removed: AnnotationId,
        strategy: MergeStrategy,
        /// Superseded body entries of either record not written back.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        dropped: Vec<JsonValue>,
    },
    /// One side no longer exists, or both ids name the same record.
    AlreadyConsolidated { survivor: Option<AnnotationId> },
    NotDuplicate {
        relation: TargetRelation,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
}

/// Writes merged survivors and removes duplicates.
pub struct Consolidator<S> {
    store: Arc<S>,
    cache: AnnotationCache,
    policy: DuplicatePolicy,
    delay: Duration,
}

impl<S: AnnotationStore + 'static> Consolidator<S> {
    pub fn new(store: Arc<S>, cache: AnnotationCache, policy: DuplicatePolicy) -> Self {
        Self {
            store,
            cache,
            policy,
            delay: Duration::from_millis(defaults::BATCH_DELAY_MS),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn policy(&self) -> &DuplicatePolicy {
        &self.policy
    }

    async fn read_if_present(&self, id: &AnnotationId) -> Result<Option<FreshRecord>> {
        match read_fresh(self.store.as_ref(), id).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Consolidate the pair `a`/`b`. Running it again on a consolidated pair
    /// performs no writes.
    #[instrument(skip(self), fields(subsystem = "engine", component = "duplicates", op = "consolidate", a = %a, b = %b))]
    pub async fn consolidate(
        &self,
        a: &AnnotationId,
        b: &AnnotationId,
    ) -> Result<ConsolidationOutcome> {
        if a == b {
            return Ok(ConsolidationOutcome::AlreadyConsolidated {
                survivor: Some(a.clone()),
            });
        }

        let first = self.read_if_present(a).await?;
        let second = self.read_if_present(b).await?;
        let (first, second) = match (first, second) {
            (Some(x), Some(y)) => (x, y),
            (x, y) => {
                let survivor = x.or(y).and_then(|r| r.annotation.id);
                debug!("Pair already consolidated");
                return Ok(ConsolidationOutcome::AlreadyConsolidated { survivor });
            }
        };

        let verdict = detect(&first.annotation, &second.annotation, &self.policy);
        let Some(strategy) = verdict.strategy.filter(|_| verdict.is_duplicate) else {
            if let Some(warning) = &verdict.warning {
                warn!(warning = %warning, "Pair not consolidated");
            }
            return Ok(ConsolidationOutcome::NotDuplicate {
                relation: verdict.relation,
                warning: verdict.warning,
            });
        };

        let (older, newer) = if std::ptr::eq(
            order_by_age(&first.annotation, &second.annotation).0,
            &first.annotation,
        ) {
            (&first, &second)
        } else {
            (&second, &first)
        };
        let merged = merge(&older.annotation, &newer.annotation, strategy, Utc::now());
        let mut dropped: Vec<JsonValue> = older
            .dropped
            .iter()
            .chain(newer.dropped.iter())
            .cloned()
            .collect();
        for entry in superseded_bodies(&older.annotation.body, &newer.annotation.body) {
            dropped.push(serde_json::to_value(&entry)?);
        }

        let survivor = persist_update(
            self.store.as_ref(),
            &self.cache,
            &merged,
            &older.version,
            &older.annotation.targets,
        )
        .await?;
        let removed = newer
            .annotation
            .id
            .clone()
            .unwrap_or_else(|| b.clone());
        persist_delete(
            self.store.as_ref(),
            &self.cache,
            &removed,
            &newer.version,
            &newer.annotation.targets,
        )
        .await?;

        info!(survivor = %survivor.id, removed = %removed, ?strategy, "Duplicate consolidated");
        Ok(ConsolidationOutcome::Merged {
            survivor: survivor.id,
            removed,
            strategy,
            dropped,
        })
    }

    /// Scan the whole container and consolidate every duplicate pair.
    #[instrument(skip(self), fields(subsystem = "engine", component = "duplicates", op = "consolidate_all"))]
    pub async fn consolidate_all(&self) -> Result<BatchResult<ConsolidationOutcome>> {
        let records = list_linking(self.store.as_ref()).await?;
        let mut result = BatchResult::new();
        let mut annotations = Vec::with_capacity(records.len());
        for record in &records {
            match normalize_stored(record, self.store.canonicalizer()) {
                Ok(normalized) => annotations.push(normalized.annotation),
                Err(e) => result.push_failure(record.id.clone(), e),
            }
        }

        let pairs = scan_duplicates(&annotations, &self.policy);
        debug!(pair_count = pairs.len(), "Duplicate scan complete");

        for (i, pair) in pairs.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.delay).await;
            }
            let outcome = self.consolidate(&pair.survivor, &pair.duplicate).await;
            result.record(pair.duplicate.clone(), outcome);
        }

        info!(
            result_count = result.succeeded.len(),
            failure_count = result.failed.len(),
            "Consolidation pass complete"
        );
        Ok(result)
    }
}
