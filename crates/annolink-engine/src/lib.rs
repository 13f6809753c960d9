//! # annolink-engine
//!
//! Consistency engine for linking annotations.
//!
//! This crate provides:
//! - Normalization of stored linking annotations into one canonical shape
//! - Conflict analysis for proposed links, with merge candidates
//! - Duplicate detection and consolidation
//! - Cascade of primary-annotation deletions into linking annotations
//! - Orphaned-target audit and repair
//! - A bulk read cache with per-scope circuit breaking
//!
//! ## Example
//!
//! ```ignore
//! use annolink_engine::{EngineConfig, LinkingEngine};
//! use annolink_store::RemoteStoreClient;
//!
//! let store = RemoteStoreClient::from_env()?;
//! let engine = LinkingEngine::new(store, EngineConfig::from_env());
//!
//! let report = engine.validate_linking(&candidate_ids, None).await?;
//! if report.is_valid {
//!     engine.link(annotation).await?;
//! }
//!
//! // After deleting primary annotations
//! let result = engine.cascade_delete_from_linking(&deleted_ids).await?;
//! ```

pub mod cache;
pub mod cascade;
pub mod config;
pub mod conflict;
pub mod duplicates;
pub mod engine;
pub mod normalizer;
pub mod orphans;
pub mod persist;

// Re-export core types
pub use annolink_core::*;

pub use cache::{
    canvas_scope, target_scope, AnnotationCache, BulkCache, CacheConfig, CacheRead, CacheStats,
    CircuitState,
};
pub use cascade::{CascadeAction, CascadeCoordinator, CascadeDecision, CascadeResult};
pub use config::EngineConfig;
pub use conflict::{
    ConflictAnalyzer, ConflictReport, LinkConflict, LinkProposal, MergeCandidate, Relation,
};
pub use duplicates::{
    ConsolidationOutcome, Consolidator, DuplicatePair, DuplicatePolicy, DuplicateVerdict,
    MergeStrategy, TargetRelation,
};
pub use engine::{CanvasLinks, LinkAction, LinkOutcome, LinkingEngine};
pub use normalizer::{normalize, normalize_stored, BodyClassification, NormalizedAnnotation};
pub use orphans::{OrphanAuditor, OrphanRepairOutcome, OrphanedTargetAnalysis, TargetCheck};
