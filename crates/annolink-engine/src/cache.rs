//! Resilient bulk cache for store queries.
//!
//! Each scope key (a target/motivation signature or a canvas) holds the last
//! fetched value, the set of annotation ids it depends on, at most one
//! in-flight fetch, and a failure circuit:
//!
//! - reads within the TTL are served from memory
//! - concurrent reads of the same scope share one fetch
//! - consecutive failures past the threshold open the circuit for a backoff
//!   period; while open, reads return stale data (or nothing) without
//!   touching the store
//! - a gateway failure (502/504) opens the circuit permanently and blocks the
//!   signature for the rest of the process
//!
//! Invalidation drops data and in-flight fetches but never resets circuit
//! state, so a broken query stays broken until the backoff elapses.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `ANNOLINK_CACHE_TTL_SECS`: freshness window (default: 30)
//! - `ANNOLINK_CACHE_FAILURE_THRESHOLD`: failures before opening (default: 3)
//! - `ANNOLINK_CACHE_BACKOFF_SECS`: open-circuit backoff (default: 30)

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use annolink_core::{defaults, AnnotationId, Result, StoredAnnotation};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Cache of store query results, shared by every engine component.
pub type AnnotationCache = BulkCache<Vec<StoredAnnotation>>;

/// Cache tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub failure_threshold: u32,
    pub backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(defaults::CACHE_TTL_SECS),
            failure_threshold: defaults::CACHE_FAILURE_THRESHOLD,
            backoff: Duration::from_secs(defaults::CACHE_BACKOFF_SECS),
        }
    }
}

impl CacheConfig {
    /// Read cache settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let ttl = std::env::var("ANNOLINK_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::CACHE_TTL_SECS);
        let failure_threshold = std::env::var("ANNOLINK_CACHE_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::CACHE_FAILURE_THRESHOLD);
        let backoff = std::env::var("ANNOLINK_CACHE_BACKOFF_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::CACHE_BACKOFF_SECS);

        Self {
            ttl: Duration::from_secs(ttl),
            failure_threshold: failure_threshold.max(1),
            backoff: Duration::from_secs(backoff),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Outcome of a cached read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead<T> {
    /// Fetched now or within the TTL.
    Fresh(T),
    /// Last known value, served because the store could not be reached.
    Stale(T),
    /// Nothing cached and the store is not being asked.
    Empty,
}

impl<T> CacheRead<T> {
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheRead::Fresh(_))
    }

    /// Whether the value may not reflect the store.
    pub fn is_degraded(&self) -> bool {
        !self.is_fresh()
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            CacheRead::Fresh(v) | CacheRead::Stale(v) => Some(v),
            CacheRead::Empty => None,
        }
    }
}

/// Externally visible circuit position of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    PermanentlyOpen,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub fetches: u64,
    pub failures: u64,
    pub short_circuited: u64,
}

#[derive(Debug, Clone, Copy)]
enum Circuit {
    Closed,
    Open { until: Instant },
    PermanentlyOpen,
}

struct ScopeEntry<T> {
    value: Option<(T, Instant)>,
    dependencies: HashSet<AnnotationId>,
    in_flight: Option<(u64, SharedFetch<T>)>,
    failures: u32,
    circuit: Circuit,
}

impl<T: Clone> ScopeEntry<T> {
    fn new() -> Self {
        Self {
            value: None,
            dependencies: HashSet::new(),
            in_flight: None,
            failures: 0,
            circuit: Circuit::Closed,
        }
    }

    fn fallback(&self) -> CacheRead<T> {
        match &self.value {
            Some((v, _)) => CacheRead::Stale(v.clone()),
            None => CacheRead::Empty,
        }
    }

    fn clear_data(&mut self) {
        self.value = None;
        self.in_flight = None;
    }

    /// Nothing cached and no breaker history worth keeping.
    fn is_idle(&self) -> bool {
        self.value.is_none()
            && self.in_flight.is_none()
            && self.failures == 0
            && matches!(self.circuit, Circuit::Closed)
    }
}

struct CacheState<T> {
    scopes: HashMap<String, ScopeEntry<T>>,
    blocked: HashSet<String>,
    next_fetch: u64,
    stats: CacheStats,
}

/// Keyed cache with request de-duplication and per-key circuit breaking.
///
/// Cloning shares the underlying state.
pub struct BulkCache<T> {
    config: CacheConfig,
    state: Arc<Mutex<CacheState<T>>>,
}

impl<T> Clone for BulkCache<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BulkCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(CacheState {
                scopes: HashMap::new(),
                blocked: HashSet::new(),
                next_fetch: 0,
                stats: CacheStats::default(),
            })),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read `key`, calling `fetch` only when no fresh value, no shared
    /// in-flight fetch and no open circuit applies.
    ///
    /// `dependencies` are the annotation ids whose change invalidates this
    /// scope. A failed fetch yields the stale value when one exists and the
    /// error otherwise.
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        dependencies: &[AnnotationId],
        fetch: F,
    ) -> Result<CacheRead<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (fetch_id, pending) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let candidate = state.next_fetch + 1;
            let blocked = state.blocked.contains(key);
            let now = Instant::now();
            let ttl = self.config.ttl;

            let entry = state
                .scopes
                .entry(key.to_string())
                .or_insert_with(ScopeEntry::new);
            entry.dependencies.extend(dependencies.iter().cloned());

            let early = if blocked || matches!(entry.circuit, Circuit::PermanentlyOpen) {
                Some(entry.fallback())
            } else if let Some((v, at)) = entry
                .value
                .as_ref()
                .filter(|(_, at)| now.duration_since(*at) < ttl)
            {
                debug!(scope_key = key, age_ms = now.duration_since(*at).as_millis() as u64, "Cache hit");
                Some(CacheRead::Fresh(v.clone()))
            } else if matches!(entry.circuit, Circuit::Open { until } if now < until) {
                Some(entry.fallback())
            } else {
                None
            };

            if let Some(read) = early {
                if read.is_fresh() {
                    state.stats.hits += 1;
                } else {
                    debug!(scope_key = key, "Circuit open, skipping store");
                    state.stats.short_circuited += 1;
                }
                return Ok(read);
            }

            let (fetch_id, pending, started) = match &entry.in_flight {
                Some((id, pending)) => (*id, pending.clone(), false),
                None => {
                    let pending = fetch().boxed().shared();
                    entry.in_flight = Some((candidate, pending.clone()));
                    (candidate, pending, true)
                }
            };
            if started {
                state.next_fetch = candidate;
                state.stats.fetches += 1;
            }
            (fetch_id, pending)
        };

        let outcome = pending.await;

        let mut guard = self.lock();
        let state = &mut *guard;
        let threshold = self.config.failure_threshold;
        let backoff = self.config.backoff;
        let mut block = false;
        let mut stale = None;

        if let Some(entry) = state.scopes.get_mut(key) {
            let current = matches!(&entry.in_flight, Some((id, _)) if *id == fetch_id);
            if current {
                entry.in_flight = None;
                match &outcome {
                    Ok(v) => {
                        entry.value = Some((v.clone(), Instant::now()));
                        entry.failures = 0;
                        entry.circuit = Circuit::Closed;
                    }
                    Err(e) => {
                        entry.failures += 1;
                        if e.is_gateway() {
                            warn!(scope_key = key, error = %e, "Gateway failure, blocking query signature");
                            entry.circuit = Circuit::PermanentlyOpen;
                            block = true;
                        } else if entry.failures >= threshold {
                            warn!(
                                scope_key = key,
                                failure_count = entry.failures,
                                backoff_secs = backoff.as_secs(),
                                "Opening circuit"
                            );
                            entry.circuit = Circuit::Open {
                                until: Instant::now() + backoff,
                            };
                        }
                    }
                }
            }
            if outcome.is_err() {
                stale = entry.value.as_ref().map(|(v, _)| v.clone());
            }
        }
        if block {
            state.blocked.insert(key.to_string());
        }
        if outcome.is_err() {
            state.stats.failures += 1;
        }
        drop(guard);

        match outcome {
            Ok(v) => Ok(CacheRead::Fresh(v)),
            Err(e) => match stale {
                Some(v) => {
                    debug!(scope_key = key, error = %e, "Fetch failed, serving stale value");
                    Ok(CacheRead::Stale(v))
                }
                None => Err(e),
            },
        }
    }

    /// Drop cached data for one scope, or for all scopes when `key` is
    /// `None`. Circuit state survives; scopes left idle are removed.
    pub fn invalidate(&self, key: Option<&str>) {
        let mut state = self.lock();
        match key {
            Some(key) => {
                let idle = state.scopes.get_mut(key).map(|entry| {
                    entry.clear_data();
                    entry.is_idle()
                });
                if idle == Some(true) {
                    state.scopes.remove(key);
                }
            }
            None => {
                for entry in state.scopes.values_mut() {
                    entry.clear_data();
                }
                state.scopes.retain(|_, entry| !entry.is_idle());
            }
        }
    }

    /// Drop cached data for every scope that depends on one of `ids`, removing
    /// the scopes left idle. Returns the number of scopes cleared.
    pub fn invalidate_for_ids(&self, ids: &[AnnotationId]) -> usize {
        let mut state = self.lock();
        let mut cleared = 0;
        state.scopes.retain(|_, entry| {
            if !ids.iter().any(|id| entry.dependencies.contains(id)) {
                return true;
            }
            entry.clear_data();
            cleared += 1;
            !entry.is_idle()
        });
        cleared
    }

    /// Scopes currently tracked, cached or not.
    pub fn scope_count(&self) -> usize {
        self.lock().scopes.len()
    }

    pub fn circuit_state(&self, key: &str) -> CircuitState {
        let state = self.lock();
        if state.blocked.contains(key) {
            return CircuitState::PermanentlyOpen;
        }
        match state.scopes.get(key).map(|e| e.circuit) {
            Some(Circuit::PermanentlyOpen) => CircuitState::PermanentlyOpen,
            Some(Circuit::Open { until }) if Instant::now() < until => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.lock().scopes.get(key).map_or(0, |e| e.failures)
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.lock().blocked.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }
}

/// Scope key for a target query.
pub fn target_scope(target: &AnnotationId, motivation: &str) -> String {
    format!("target:{}|motivation:{}", target, motivation)
}

/// Scope key for a canvas-wide linking read.
pub fn canvas_scope(canvas: &str) -> String {
    format!("canvas:{}", canvas)
}
