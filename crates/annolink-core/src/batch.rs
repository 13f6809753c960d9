//! Typed outcome of best-effort batch operations.
//!
//! Maintenance passes (cascade deletion, orphan audits, consolidation) keep
//! going when one item fails; every failure is collected here together with
//! the item it belongs to, so callers can report counts or retry selectively.

use serde::Serialize;

use crate::error::Error;
use crate::ids::AnnotationId;

/// Failure of one item within a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub id: AnnotationId,
    #[serde(serialize_with = "serialize_error")]
    pub error: Error,
}

fn serialize_error<S: serde::Serializer>(error: &Error, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&error.to_string())
}

/// Successes and failures of a batch, in processing order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<ItemFailure>,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchResult<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success(&mut self, item: T) {
        self.succeeded.push(item);
    }

    pub fn push_failure(&mut self, id: AnnotationId, error: Error) {
        self.failed.push(ItemFailure { id, error });
    }

    /// Record the outcome of one item.
    pub fn record(&mut self, id: AnnotationId, outcome: Result<T, Error>) {
        match outcome {
            Ok(item) => self.push_success(item),
            Err(error) => self.push_failure(id, error),
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Failures whose error asks for a re-read before retrying.
    pub fn version_conflicts(&self) -> impl Iterator<Item = &ItemFailure> {
        self.failed.iter().filter(|f| f.error.is_version_conflict())
    }
}
