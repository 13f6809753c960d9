//! # annolink-core
//!
//! Core types, traits, and abstractions for the annolink consistency engine.
//!
//! This crate provides the linking annotation model, canonical identifiers,
//! the shared error type, and the [`AnnotationStore`] seam that the store
//! client and the engine meet at.

pub mod batch;
pub mod defaults;
pub mod document;
pub mod error;
pub mod ids;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use batch::{BatchResult, ItemFailure};
pub use error::{Error, Result};
pub use ids::{AnnotationId, IdCanonicalizer};
pub use models::*;
pub use traits::*;
