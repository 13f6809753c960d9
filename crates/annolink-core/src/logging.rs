//! Structured logging schema and field name constants for annolink.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query by the same names across the store client,
//! the cache, and every engine component.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, batch completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (targets checked, pages fetched) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID for one maintenance run (UUIDv7).
pub const RUN_ID: &str = "run_id";

/// Subsystem originating the log event.
/// Values: "store", "cache", "engine", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "http_client", "bulk_cache", "cascade", "orphans", "duplicates"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "get", "update", "cascade_delete", "audit", "consolidate"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Linking annotation id being operated on.
pub const ANNOTATION_ID: &str = "annotation_id";

/// Primary annotation id (a target).
pub const TARGET_ID: &str = "target_id";

/// Cache scope key.
pub const SCOPE_KEY: &str = "scope_key";

/// Motivation used in a store query.
pub const MOTIVATION: &str = "motivation";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of targets on an annotation or in a request.
pub const TARGET_COUNT: &str = "target_count";

/// Number of annotations returned by a query or page.
pub const RESULT_COUNT: &str = "result_count";

/// Page number in a paged listing.
pub const PAGE: &str = "page";

/// Consecutive failure count for a cache scope.
pub const FAILURE_COUNT: &str = "failure_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// HTTP status code returned by the store.
pub const STATUS: &str = "status";

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
