//! Engine configuration.
//!
//! ## Environment variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `ANNOLINK_CACHE_TTL_SECS` | 30 | Bulk cache freshness window |
//! | `ANNOLINK_CACHE_FAILURE_THRESHOLD` | 3 | Failures before a circuit opens |
//! | `ANNOLINK_CACHE_BACKOFF_SECS` | 30 | Open-circuit backoff |
//! | `ANNOLINK_DUPLICATE_WINDOW_HOURS` | 48 | Reordered-duplicate window |
//! | `ANNOLINK_POINT_TOLERANCE` | 0 | Pixel tolerance for equal points |
//! | `ANNOLINK_BATCH_DELAY_MS` | 100 | Pause between items in bulk passes |

use std::time::Duration;

use annolink_core::defaults;

use crate::cache::CacheConfig;
use crate::duplicates::DuplicatePolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub duplicates: DuplicatePolicy,
    /// Pause between items of cascade, orphan and consolidation passes.
    pub batch_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            duplicates: DuplicatePolicy::default(),
            batch_delay: Duration::from_millis(defaults::BATCH_DELAY_MS),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let batch_delay_ms = std::env::var("ANNOLINK_BATCH_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::BATCH_DELAY_MS);

        Self {
            cache: CacheConfig::from_env(),
            duplicates: DuplicatePolicy::from_env(),
            batch_delay: Duration::from_millis(batch_delay_ms),
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_duplicates(mut self, duplicates: DuplicatePolicy) -> Self {
        self.duplicates = duplicates;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.ttl, Duration::from_secs(defaults::CACHE_TTL_SECS));
        assert_eq!(config.cache.failure_threshold, defaults::CACHE_FAILURE_THRESHOLD);
        assert_eq!(config.duplicates.window, chrono::Duration::hours(48));
        assert_eq!(config.batch_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_batch_delay(Duration::ZERO)
            .with_duplicates(DuplicatePolicy::default().with_point_tolerance(0.5));
        assert_eq!(config.batch_delay, Duration::ZERO);
        assert_eq!(config.duplicates.point_tolerance, 0.5);
    }
}
