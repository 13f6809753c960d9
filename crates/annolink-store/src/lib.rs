//! # annolink-store
//!
//! Client for the remote W3C annotation repository that holds linking
//! annotations.
//!
//! This crate provides:
//! - [`RemoteStoreClient`], an [`AnnotationStore`](annolink_core::AnnotationStore)
//!   over HTTP with bearer auth, ETag/If-Match concurrency, HEAD existence
//!   checks, custom target queries and paged listing
//! - Environment-driven [`StoreConfig`]
//! - Status-code classification into annolink errors
//! - An in-memory store for tests (feature `mock`)
//!
//! # Example
//!
//! ```rust,no_run
//! use annolink_store::RemoteStoreClient;
//! use annolink_core::AnnotationStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RemoteStoreClient::from_env().expect("store configuration");
//!     let id = store.canonicalizer().canonicalize("abc123").unwrap();
//!     let record = store.get(&id).await.unwrap();
//!     println!("{} at version {:?}", record.id, record.version);
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;

#[cfg(feature = "mock")]
pub mod mock;

pub use client::RemoteStoreClient;
pub use config::{ConfigError, StoreConfig};
pub use error::{to_annolink_error, StoreErrorCode};
