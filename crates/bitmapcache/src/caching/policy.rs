use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::EntryState;
use crate::config::CacheConfig;

/// Decides whether an unreferenced bitmap may be freed.
///
/// Policies are consulted by the background eviction scan. They must be pure: no I/O, no
/// blocking, and no mutation of cache state.
pub trait EvictionPolicy: Send + Sync + 'static {
    /// Returns `true` if the entry described by `entry` should be evicted at `now`.
    fn should_evict(&self, entry: &EntryState, now: Instant) -> bool;
}

impl<F> EvictionPolicy for F
where
    F: Fn(&EntryState, Instant) -> bool + Send + Sync + 'static,
{
    fn should_evict(&self, entry: &EntryState, now: Instant) -> bool {
        self(entry, now)
    }
}

/// Evicts bitmaps that have not been referenced for at least `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeoutPolicy {
    timeout: Duration,
}

impl IdleTimeoutPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for IdleTimeoutPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl EvictionPolicy for IdleTimeoutPolicy {
    fn should_evict(&self, entry: &EntryState, now: Instant) -> bool {
        entry.refcount == 0 && now.saturating_duration_since(entry.idle_since) >= self.timeout
    }
}

/// Never evicts anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeverEvict;

impl EvictionPolicy for NeverEvict {
    fn should_evict(&self, _entry: &EntryState, _now: Instant) -> bool {
        false
    }
}

/// Creates the policy described by the configured idle timeout.
pub fn policy_from_config(config: &CacheConfig) -> Arc<dyn EvictionPolicy> {
    match config.idle_timeout {
        Some(timeout) => Arc::new(IdleTimeoutPolicy::new(timeout)),
        None => Arc::new(NeverEvict),
    }
}
