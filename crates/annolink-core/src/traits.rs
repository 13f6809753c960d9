//! Core traits for annolink abstractions.
//!
//! The engine never talks HTTP directly; it works against [`AnnotationStore`],
//! implemented by the remote repository client and by an in-memory store for
//! tests.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::ids::{AnnotationId, IdCanonicalizer};
use crate::models::{ListingPage, StoredAnnotation, VersionToken};

/// Outcome of a lightweight existence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceCheck {
    pub exists: bool,
    /// HTTP status when the store answered.
    pub status: Option<u16>,
    /// Why the target counts as missing.
    pub reason: Option<String>,
}

impl ExistenceCheck {
    pub fn found(status: u16) -> Self {
        Self {
            exists: true,
            status: Some(status),
            reason: None,
        }
    }

    pub fn missing(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            exists: false,
            status,
            reason: Some(reason.into()),
        }
    }
}

/// Remote annotation repository with optimistic concurrency.
///
/// Every update and delete must present the version token from a read
/// immediately preceding the write; a stale token fails with
/// `Error::VersionConflict`.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Canonical id mapping for this store.
    fn canonicalizer(&self) -> &IdCanonicalizer;

    /// Read one annotation together with its current version token.
    async fn get(&self, id: &AnnotationId) -> Result<StoredAnnotation>;

    /// Probe whether an annotation still exists. Network failures are
    /// reported as a missing target, not as an error.
    async fn exists(&self, id: &AnnotationId) -> ExistenceCheck;

    /// Create a new annotation; the store assigns the id.
    async fn create(&self, document: &JsonValue) -> Result<StoredAnnotation>;

    /// Replace an annotation, guarded by `version`.
    async fn update(
        &self,
        id: &AnnotationId,
        document: &JsonValue,
        version: &VersionToken,
    ) -> Result<StoredAnnotation>;

    /// Delete an annotation, guarded by `version`.
    async fn delete(&self, id: &AnnotationId, version: &VersionToken) -> Result<()>;

    /// Annotations whose target contains `target` and whose motivation or
    /// body purpose equals `motivation`.
    async fn query_by_target(
        &self,
        target: &AnnotationId,
        motivation: &str,
    ) -> Result<Vec<StoredAnnotation>>;

    /// One page of the container listing, starting at page 0.
    async fn list_page(&self, page: u32) -> Result<ListingPage>;
}
