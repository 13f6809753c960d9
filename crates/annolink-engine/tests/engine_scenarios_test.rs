//! End-to-end engine behavior against the in-memory store.
//!
//! Batch delays are zeroed so bulk passes run back to back.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::time::Duration;

use annolink_engine::{
    AnnotationId, AnnotationStore, BodyEntry, CascadeAction, CircuitState, ConsolidationOutcome,
    ContentType, EngineConfig, Error, Geotag, LinkAction, LinkingAnnotation, MergeStrategy,
    OrphanRepairOutcome, PointSelection, TargetRelation,
};
use annolink_engine::{normalize_stored, target_scope, LinkingEngine};
use annolink_store::mock::{InMemoryStore, MockOp};

const BASE: &str = "https://store.example/w3c";
const CONTAINER: &str = "maps";

struct Fixture {
    store: InMemoryStore,
    engine: LinkingEngine<InMemoryStore>,
}

fn fixture() -> Fixture {
    let store = InMemoryStore::new(BASE, CONTAINER);
    let config = EngineConfig::default().with_batch_delay(Duration::ZERO);
    let engine = LinkingEngine::new(store.clone(), config);
    Fixture { store, engine }
}

impl Fixture {
    fn primaries(&self, slugs: &[&str]) -> Vec<AnnotationId> {
        slugs.iter().map(|s| self.store.insert_primary(s)).collect()
    }

    fn id(&self, slug: &str) -> AnnotationId {
        AnnotationId::new(format!("{}/{}/{}", BASE, CONTAINER, slug))
    }

    fn seed(&self, slug: &str, targets: &[&str], body: Vec<BodyEntry>, age_hours: i64) -> AnnotationId {
        let annotation = LinkingAnnotation::new(targets.iter().map(|t| self.id(t)).collect(), body)
            .with_id(self.id(slug))
            .with_created(Utc::now() - ChronoDuration::hours(age_hours));
        let document = annotation.to_document().unwrap();
        self.store.insert_document(document)
    }

    async fn load(&self, id: &AnnotationId) -> LinkingAnnotation {
        let stored = self.store.get(id).await.unwrap();
        normalize_stored(&stored, self.store.canonicalizer())
            .unwrap()
            .annotation
    }

    fn slugs(&self, targets: &[AnnotationId]) -> Vec<String> {
        targets.iter().map(|t| t.slug().to_string()).collect()
    }
}

fn point(x: f64, y: f64) -> BodyEntry {
    BodyEntry::Selecting(PointSelection::at(x, y))
}

fn geotag() -> BodyEntry {
    BodyEntry::Geotagging(Geotag::point(5.12, 52.09, "Utrecht"))
}

// =============================================================================
// LINK ANALYSIS
// =============================================================================

#[tokio::test]
async fn test_untouched_targets_are_valid() {
    let fx = fixture();
    let targets = fx.primaries(&["A", "B"]);

    let report = fx.engine.validate_linking(&targets, None).await.unwrap();

    assert!(report.is_valid);
    assert!(report.conflicts.is_empty());
    assert!(report.mergeable.is_empty());
}

#[tokio::test]
async fn test_complementary_geotag_is_mergeable() {
    let fx = fixture();
    let targets = fx.primaries(&["A", "B"]);
    let l1 = fx.seed("L1", &["A", "B"], vec![point(10.0, 20.0)], 1);

    let proposal = annolink_engine::LinkProposal::new(targets)
        .contributing(ContentType::Geotagging);
    let report = fx.engine.analyze_proposal(&proposal).await.unwrap();

    assert!(report.is_valid);
    assert_eq!(report.mergeable.len(), 1);
    assert_eq!(report.mergeable[0].annotation_id, l1);
    assert!(report.mergeable[0].adds.contains(&ContentType::Geotagging));
}

#[tokio::test]
async fn test_foreign_target_is_linking_conflict() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    let l1 = fx.seed("L1", &["A", "B"], vec![], 1);

    let report = fx
        .engine
        .validate_linking(&[fx.id("A"), fx.id("C")], None)
        .await
        .unwrap();

    assert!(!report.is_valid);
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.annotation_id, l1);
    assert_eq!(conflict.conflict_type, ContentType::Linking);
    assert_eq!(conflict.foreign_targets, vec![fx.id("B")]);
}

#[tokio::test]
async fn test_excluded_annotation_is_ignored() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    let l1 = fx.seed("L1", &["A", "B"], vec![], 1);

    let report = fx
        .engine
        .validate_linking(&[fx.id("A"), fx.id("C")], Some(&l1))
        .await
        .unwrap();

    assert!(report.is_valid);
}

#[tokio::test]
async fn test_bare_ids_are_canonicalized() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    fx.seed("L1", &["A", "B"], vec![], 1);

    let report = fx
        .engine
        .validate_linking(&[AnnotationId::new("A"), AnnotationId::new("C")], None)
        .await
        .unwrap();

    assert!(!report.is_valid);
}

#[tokio::test]
async fn test_mergeability_symmetry() {
    let fx = fixture();
    fx.primaries(&["x", "y", "z"]);
    let existing = fx.seed("L1", &["y", "x", "z"], vec![], 1);

    let narrow = fx
        .engine
        .validate_linking(&[fx.id("x"), fx.id("y")], None)
        .await
        .unwrap();
    assert_eq!(narrow.conflicts[0].annotation_id, existing);

    let wide = fx
        .engine
        .validate_linking(&[fx.id("x"), fx.id("y"), fx.id("z")], None)
        .await
        .unwrap();
    assert!(wide.is_valid);
    assert_eq!(wide.mergeable[0].annotation_id, existing);
}

// =============================================================================
// LINK WRITES
// =============================================================================

#[tokio::test]
async fn test_link_creates_new_annotation() {
    let fx = fixture();
    let targets = fx.primaries(&["A", "B"]);

    let outcome = fx
        .engine
        .link(LinkingAnnotation::new(targets.clone(), vec![]))
        .await
        .unwrap();

    assert_eq!(outcome.action, LinkAction::Created);
    let stored = fx.load(&outcome.annotation_id).await;
    assert_eq!(stored.targets, targets);
}

#[tokio::test]
async fn test_link_merges_geotag_into_existing() {
    let fx = fixture();
    let targets = fx.primaries(&["A", "B"]);
    let l1 = fx.seed("L1", &["A", "B"], vec![point(10.0, 20.0)], 1);
    let before = fx.store.document_count();

    let outcome = fx
        .engine
        .link(LinkingAnnotation::new(targets, vec![geotag()]))
        .await
        .unwrap();

    assert_eq!(outcome.action, LinkAction::Merged);
    assert_eq!(outcome.annotation_id, l1);
    assert_eq!(fx.store.document_count(), before);
    let merged = fx.load(&l1).await;
    assert!(merged.point_selection().is_some());
    assert!(merged.geotag().is_some());
}

#[tokio::test]
async fn test_link_folds_every_compatible_candidate() {
    let fx = fixture();
    fx.primaries(&["A", "B"]);
    let l1 = fx.seed("L1", &["A"], vec![geotag()], 3);
    let l2 = fx.seed("L2", &["B"], vec![point(7.0, 8.0)], 2);

    let outcome = fx
        .engine
        .link(LinkingAnnotation::new(vec![fx.id("A"), fx.id("B")], vec![]))
        .await
        .unwrap();

    assert_eq!(outcome.action, LinkAction::Merged);
    assert_eq!(outcome.annotation_id, l1);
    assert_eq!(outcome.absorbed, vec![l2.clone()]);
    assert!(outcome.warnings.iter().all(|w| !w.contains("consolidat")));
    assert!(!fx.store.contains(&l2));
    assert_eq!(fx.store.document_count(), 1);

    let survivor = fx.load(&l1).await;
    assert_eq!(fx.slugs(&survivor.targets), vec!["A", "B"]);
    assert!(survivor.geotag().is_some());
    assert!(survivor.point_selection().is_some());

    let result = fx.engine.consolidate_all().await.unwrap();
    assert!(result.succeeded.is_empty());
}

#[tokio::test]
async fn test_link_refuses_candidates_with_same_enhancement() {
    let fx = fixture();
    fx.primaries(&["A", "B"]);
    fx.seed("L1", &["A"], vec![geotag()], 3);
    fx.seed("L2", &["B"], vec![geotag()], 2);

    let err = fx
        .engine
        .link(LinkingAnnotation::new(vec![fx.id("A"), fx.id("B")], vec![]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(fx.store.call_count(MockOp::Update), 0);
    assert_eq!(fx.store.call_count(MockOp::Delete), 0);
}

#[tokio::test]
async fn test_link_rejects_conflict_without_writing() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    fx.seed("L1", &["A", "B"], vec![], 1);

    let err = fx
        .engine
        .link(LinkingAnnotation::new(vec![fx.id("A"), fx.id("C")], vec![]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(fx.store.call_count(MockOp::Create), 0);
    assert_eq!(fx.store.call_count(MockOp::Update), 0);
}

#[tokio::test]
async fn test_link_rejects_missing_target() {
    let fx = fixture();
    fx.primaries(&["A"]);

    let err = fx
        .engine
        .link(LinkingAnnotation::new(vec![fx.id("A"), fx.id("ghost")], vec![]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(fx.store.call_count(MockOp::Create), 0);
}

#[tokio::test]
async fn test_link_rejects_single_target_without_enhancement() {
    let fx = fixture();
    let targets = fx.primaries(&["A"]);

    let err = fx
        .engine
        .link(LinkingAnnotation::new(targets, vec![]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidAnnotation(_)));
    assert_eq!(fx.store.call_count(MockOp::Exists), 0);
}

#[tokio::test]
async fn test_link_update_keeps_created() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    let l1 = fx.seed("L1", &["A", "B"], vec![], 5);
    let original = fx.load(&l1).await;

    let edited = LinkingAnnotation::new(vec![fx.id("A"), fx.id("B"), fx.id("C")], vec![])
        .with_id(l1.clone());
    let outcome = fx.engine.link(edited).await.unwrap();

    assert_eq!(outcome.action, LinkAction::Updated);
    let stored = fx.load(&l1).await;
    assert_eq!(fx.slugs(&stored.targets), vec!["A", "B", "C"]);
    assert_eq!(stored.created, original.created);
}

#[tokio::test]
async fn test_write_invalidates_cached_lookup() {
    let fx = fixture();
    let targets = fx.primaries(&["A", "B", "C"]);

    let first = fx.engine.validate_linking(&targets[..2], None).await.unwrap();
    assert!(first.is_valid);

    fx.engine
        .link(LinkingAnnotation::new(targets[..2].to_vec(), vec![]))
        .await
        .unwrap();

    let second = fx
        .engine
        .validate_linking(&[targets[0].clone(), targets[2].clone()], None)
        .await
        .unwrap();
    assert!(!second.is_valid);
}

// =============================================================================
// DUPLICATES
// =============================================================================

#[tokio::test]
async fn test_reordered_duplicate_adopts_newer_order() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    let older = fx.seed("L1", &["A", "B", "C"], vec![], 4);
    let newer = fx.seed("L2", &["B", "C", "A"], vec![point(3.0, 4.0)], 1);

    let outcome = fx.engine.consolidate(&older, &newer).await.unwrap();

    assert_eq!(
        outcome,
        ConsolidationOutcome::Merged {
            survivor: older.clone(),
            removed: newer.clone(),
            strategy: MergeStrategy::PreserveNewerOrder,
            dropped: vec![],
        }
    );
    assert!(!fx.store.contains(&newer));
    let survivor = fx.load(&older).await;
    assert_eq!(fx.slugs(&survivor.targets), vec!["B", "C", "A"]);
    assert!(survivor.point_selection().is_some());
}

#[tokio::test]
async fn test_consolidation_is_idempotent() {
    let fx = fixture();
    fx.primaries(&["A", "B"]);
    let older = fx.seed("L1", &["A", "B"], vec![], 4);
    let newer = fx.seed("L2", &["A", "B"], vec![geotag()], 1);

    fx.engine.consolidate(&older, &newer).await.unwrap();
    let count = fx.store.document_count();
    let snapshot = fx.store.document(&older);
    fx.store.clear_calls();

    let again = fx.engine.consolidate(&older, &newer).await.unwrap();

    assert!(matches!(again, ConsolidationOutcome::AlreadyConsolidated { .. }));
    assert_eq!(fx.store.document_count(), count);
    assert_eq!(fx.store.document(&older), snapshot);
    assert_eq!(fx.store.call_count(MockOp::Update), 0);
    assert_eq!(fx.store.call_count(MockOp::Delete), 0);
}

#[tokio::test]
async fn test_old_reordered_pair_stays_independent() {
    let fx = fixture();
    fx.primaries(&["A", "B"]);
    let older = fx.seed("L1", &["A", "B"], vec![point(1.0, 1.0)], 100);
    let newer = fx.seed("L2", &["B", "A"], vec![point(9.0, 9.0)], 1);

    let outcome = fx.engine.consolidate(&older, &newer).await.unwrap();

    assert!(matches!(
        outcome,
        ConsolidationOutcome::NotDuplicate {
            relation: TargetRelation::SameSetReordered,
            warning: Some(_),
        }
    ));
    assert!(fx.store.contains(&older));
    assert!(fx.store.contains(&newer));
}

#[tokio::test]
async fn test_consolidate_all_merges_every_group() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C", "D"]);
    fx.seed("L1", &["A", "B"], vec![], 6);
    fx.seed("L2", &["A", "B"], vec![geotag()], 2);
    fx.seed("L3", &["C", "D"], vec![], 1);

    let result = fx.engine.consolidate_all().await.unwrap();

    assert!(result.is_complete_success());
    assert_eq!(result.succeeded.len(), 1);
    assert!(fx.store.contains(&fx.id("L1")));
    assert!(!fx.store.contains(&fx.id("L2")));
    assert!(fx.store.contains(&fx.id("L3")));
}

// =============================================================================
// CASCADE
// =============================================================================

#[tokio::test]
async fn test_cascade_deletes_and_updates() {
    let fx = fixture();
    let a = fx.primaries(&["A", "B", "C", "D", "E"]).remove(0);
    let l1 = fx.seed("L1", &["A", "B"], vec![], 2);
    let l2 = fx.seed("L2", &["A", "C", "D"], vec![], 2);
    let l3 = fx.seed("L3", &["D", "E"], vec![], 2);
    fx.store.remove_primary(&a);

    let result = fx.engine.cascade_delete_from_linking(&[a.clone()]).await.unwrap();

    assert_eq!(result.deleted(), vec![&l1]);
    assert_eq!(result.updated(), vec![&l2]);
    assert!(result.errors().is_empty());
    assert!(!fx.store.contains(&l1));
    assert_eq!(fx.slugs(&fx.load(&l2).await.targets), vec!["C", "D"]);
    assert!(fx.store.contains(&l3));
}

#[tokio::test]
async fn test_cascade_reports_superseded_points() {
    let fx = fixture();
    let a = fx.primaries(&["A", "B", "C"]).remove(0);
    let l1 = fx.store.insert_document(json!({
        "id": fx.id("L1").as_str(),
        "motivation": "linking",
        "target": [fx.id("A").as_str(), fx.id("B").as_str(), fx.id("C").as_str()],
        "body": [
            {"purpose": "selecting", "type": "SpecificResource",
             "selector": {"type": "PointSelector", "x": 1, "y": 1}},
            {"purpose": "selecting", "type": "SpecificResource",
             "selector": {"type": "PointSelector", "x": 2, "y": 2}}
        ]
    }));
    fx.store.remove_primary(&a);

    let result = fx.engine.cascade_delete_from_linking(&[a]).await.unwrap();

    assert_eq!(result.updated(), vec![&l1]);
    let dropped = result
        .outcome
        .succeeded
        .iter()
        .find_map(|action| match action {
            CascadeAction::Updated { dropped, .. } => Some(dropped.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0]["selector"]["x"], 1);
    let survivor = fx.load(&l1).await;
    assert_eq!(survivor.point_selection().unwrap().selector.x, 2.0);
}

#[tokio::test]
async fn test_cascade_leaves_no_dangling_targets() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C", "D"]);
    fx.seed("L1", &["A", "B", "C"], vec![], 3);
    fx.seed("L2", &["B", "D"], vec![geotag()], 3);
    fx.seed("L3", &["C", "D"], vec![], 3);
    let deleted = vec![fx.id("B"), fx.id("C")];

    fx.engine.cascade_delete_from_linking(&deleted).await.unwrap();

    let page = fx.store.list_page(0).await.unwrap();
    for record in page.items.iter().filter(|r| r.is_linking()) {
        let annotation = normalize_stored(record, fx.store.canonicalizer())
            .unwrap()
            .annotation;
        for id in &deleted {
            assert!(!annotation.targets_include(id), "{} still lists {}", record.id, id);
        }
        assert!(annotation.targets.len() >= 2 || annotation.has_enhancement());
    }
}

#[tokio::test]
async fn test_cascade_collects_item_failures() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    let l1 = fx.seed("L1", &["A", "B", "C"], vec![], 2);
    let l2 = fx.seed("L2", &["A", "C", "B"], vec![], 1);
    fx.store
        .fail_always_for(MockOp::Update, &l1, Error::Timeout("slow".into()));

    let result = fx.engine.cascade_delete_from_linking(&[fx.id("A")]).await.unwrap();

    assert_eq!(result.errors().len(), 1);
    assert_eq!(result.errors()[0].id, l1);
    assert_eq!(result.updated(), vec![&l2]);
}

#[tokio::test]
async fn test_cascade_rereads_after_concurrent_edit() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    let l1 = fx.seed("L1", &["A", "B", "C"], vec![], 2);
    fx.store.touch(&l1);

    let result = fx.engine.cascade_delete_from_linking(&[fx.id("A")]).await.unwrap();

    assert!(result.errors().is_empty());
    assert!(matches!(
        result.outcome.succeeded[0],
        CascadeAction::Updated { .. }
    ));
}

// =============================================================================
// ORPHANS
// =============================================================================

#[tokio::test]
async fn test_orphan_repair_strips_missing_targets() {
    let fx = fixture();
    fx.primaries(&["A", "B"]);
    let l1 = fx.seed("L1", &["A", "gone", "B"], vec![], 2);
    let annotation = fx.load(&l1).await;

    let outcome = fx.engine.audit_and_repair_orphans(&annotation).await.unwrap();

    assert_eq!(
        outcome,
        OrphanRepairOutcome::Repaired {
            annotation_id: l1.clone(),
            removed: vec![fx.id("gone")],
            remaining: vec![fx.id("A"), fx.id("B")],
            dropped: vec![],
        }
    );
    assert_eq!(fx.slugs(&fx.load(&l1).await.targets), vec!["A", "B"]);
}

#[tokio::test]
async fn test_orphan_repair_deletes_below_two_targets() {
    let fx = fixture();
    fx.primaries(&["A"]);
    let l1 = fx.seed("L1", &["A", "gone"], vec![geotag()], 2);

    let outcome = fx.engine.audit_and_repair_orphans_by_id(&l1).await.unwrap();

    assert!(matches!(outcome, OrphanRepairOutcome::Deleted { .. }));
    assert!(!fx.store.contains(&l1));
}

#[tokio::test]
async fn test_intact_annotation_is_not_written() {
    let fx = fixture();
    fx.primaries(&["A", "B"]);
    let l1 = fx.seed("L1", &["A", "B"], vec![], 2);
    let annotation = fx.load(&l1).await;

    let outcome = fx.engine.audit_and_repair_orphans(&annotation).await.unwrap();

    assert_eq!(outcome, OrphanRepairOutcome::Intact { annotation_id: l1 });
    assert_eq!(fx.store.call_count(MockOp::Update), 0);
    assert_eq!(fx.store.call_count(MockOp::Delete), 0);
}

#[tokio::test]
async fn test_audit_records_failure_reason() {
    let fx = fixture();
    fx.primaries(&["A", "B"]);
    let annotation = LinkingAnnotation::new(vec![fx.id("A"), fx.id("B")], vec![]);
    fx.store.fail_always_for(
        MockOp::Exists,
        &fx.id("B"),
        Error::Timeout("HEAD timed out".into()),
    );

    let analysis = fx.engine.audit_orphans(&annotation).await;

    assert_eq!(analysis.orphaned_targets, vec![fx.id("B")]);
    let detail = analysis.details.iter().find(|d| !d.exists).unwrap();
    assert!(detail.reason.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_audit_all_repairs_container() {
    let fx = fixture();
    fx.primaries(&["A", "B", "C"]);
    fx.seed("L1", &["A", "B", "gone"], vec![], 2);
    fx.seed("L2", &["B", "C"], vec![], 2);
    fx.seed("L3", &["gone", "C"], vec![], 2);

    let result = fx.engine.audit_all_orphans().await.unwrap();

    assert!(result.is_complete_success());
    assert_eq!(result.succeeded.len(), 3);
    assert!(!fx.store.contains(&fx.id("L3")));
    assert_eq!(fx.slugs(&fx.load(&fx.id("L1")).await.targets), vec!["A", "B"]);
}

// =============================================================================
// CACHE
// =============================================================================

#[tokio::test]
async fn test_gateway_failure_blocks_scope_permanently() {
    let fx = fixture();
    let targets = fx.primaries(&["A", "B"]);
    fx.store.fail_always(
        MockOp::Query,
        Error::Gateway {
            status: 504,
            message: "upstream timeout".into(),
        },
    );

    let first = fx.engine.validate_linking(&targets, None).await;
    assert!(first.unwrap_err().is_gateway());
    let scope = target_scope(&targets[0], "linking");
    assert_eq!(fx.engine.cache().circuit_state(&scope), CircuitState::PermanentlyOpen);
    assert_eq!(fx.store.call_count(MockOp::Query), 1);

    fx.store.clear_faults();
    fx.engine.invalidate_cache(Some(&scope));
    let calls_before = fx.store.call_count(MockOp::Query);
    let report = fx.engine.validate_linking(&targets[..1], None).await.unwrap();

    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("circuit open") && w.contains("linking lookup")));
    // Only the geotagging scope for A may still reach the store.
    assert_eq!(fx.store.call_count(MockOp::Query), calls_before + 1);
}

#[tokio::test]
async fn test_canvas_lookup_is_cached() {
    let fx = fixture();
    let targets = fx.primaries(&["A", "B", "C"]);
    fx.seed("L1", &["A", "B"], vec![], 2);
    fx.seed("L2", &["B", "C"], vec![], 2);

    let first = fx.engine.linking_for_canvas("canvas-1", &targets).await.unwrap();
    let queries = fx.store.call_count(MockOp::Query);
    let second = fx.engine.linking_for_canvas("canvas-1", &targets).await.unwrap();

    assert_eq!(first.annotations.len(), 2);
    assert!(!first.degraded);
    assert_eq!(second, first);
    assert_eq!(fx.store.call_count(MockOp::Query), queries);
}
