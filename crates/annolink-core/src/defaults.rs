//! Centralized default constants for annolink.
//!
//! **This module is the single source of truth** for shared default values.
//! Tunable policy (duplicate window, coordinate tolerance, circuit breaker)
//! lives here as named constants so it can be tested at its boundaries.

// =============================================================================
// ANNOTATION VOCABULARY
// =============================================================================

/// Motivation carried by every linking annotation.
pub const LINKING_MOTIVATION: &str = "linking";

/// Legacy motivation used by older geotag-only records.
pub const LEGACY_GEOTAGGING_MOTIVATION: &str = "geotagging";

/// Default `type` for body entries.
pub const SPECIFIC_RESOURCE: &str = "SpecificResource";

/// Selector type for pixel points on the source map.
pub const POINT_SELECTOR: &str = "PointSelector";

/// Default geometry type for geotag sources.
pub const DEFAULT_GEOMETRY_TYPE: &str = "Point";

/// W3C Web Annotation JSON-LD context.
pub const ANNOTATION_CONTEXT: &str = "http://www.w3.org/ns/anno.jsonld";

/// Label of the sentinel creator filled in when none is recorded.
pub const UNKNOWN_CREATOR_LABEL: &str = "Unknown person";

// =============================================================================
// REMOTE STORE
// =============================================================================

/// Default container holding linking annotations.
pub const STORE_CONTAINER: &str = "necessaryreunions";

/// Custom query used to find annotations by target and motivation.
pub const TARGET_MOTIVATION_QUERY: &str = "with-target-and-motivation-or-purpose";

/// Timeout for regular store reads and writes in seconds.
pub const STORE_TIMEOUT_SECS: u64 = 30;

/// Timeout for HEAD existence checks in seconds.
pub const EXISTS_TIMEOUT_SECS: u64 = 10;

/// Hard stop for paged listings, guarding against a store that never
/// reports an empty page.
pub const MAX_LISTING_PAGES: u32 = 1_000;

// =============================================================================
// BULK CACHE
// =============================================================================

/// Lifetime of a cached scope entry in seconds.
pub const CACHE_TTL_SECS: u64 = 30;

/// Consecutive failures before the circuit opens.
pub const CACHE_FAILURE_THRESHOLD: u32 = 3;

/// Backoff window while the circuit is open, in seconds.
pub const CACHE_BACKOFF_SECS: u64 = 30;

/// Statuses treated as structural gateway failures (permanent circuit).
pub const GATEWAY_FAILURE_STATUSES: [u16; 2] = [502, 504];

// =============================================================================
// DUPLICATE DETECTION
// =============================================================================

/// Two same-set annotations created within this window (hours) are
/// re-save races when the newer one carries an enhancement.
pub const DUPLICATE_WINDOW_HOURS: i64 = 48;

/// Allowed difference between point selector coordinates (pixels) for
/// two selections to count as identical. Zero means exact equality.
pub const POINT_TOLERANCE: f64 = 0.0;

// =============================================================================
// BATCH PROCESSING
// =============================================================================

/// Delay between items in sequential maintenance passes, in milliseconds.
pub const BATCH_DELAY_MS: u64 = 100;
