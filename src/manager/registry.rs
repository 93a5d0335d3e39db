//! Lock-free component registry
//!
//! Readers load an immutable snapshot; writers clone, modify and swap it in
//! under a writer-only mutex.

use crate::error_recovery::circuit_breaker::CircuitBreaker;
use crate::health::HealthCheckable;
use crate::rate_limiter::RateLimiter;
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// One immutable view of every registered component
#[derive(Clone, Default)]
pub struct Components {
    pub breakers: HashMap<String, Arc<CircuitBreaker>>,
    pub limiters: HashMap<String, Arc<RateLimiter>>,
    pub health_checks: HashMap<String, Arc<dyn HealthCheckable>>,
}

impl Components {
    /// Every component name with a breaker, limiter or health check
    pub fn names(&self) -> BTreeSet<String> {
        self.breakers
            .keys()
            .chain(self.limiters.keys())
            .chain(self.health_checks.keys())
            .cloned()
            .collect()
    }
}

/// Name to component registry
#[derive(Default)]
pub struct ComponentRegistry {
    current: ArcSwap<Components>,
    writer: Mutex<()>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Components> {
        self.current.load_full()
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.current.load().breakers.get(name).cloned()
    }

    pub fn limiter(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.current.load().limiters.get(name).cloned()
    }

    /// Breaker for `name`, registering one built by `make` if absent
    pub fn breaker_or_insert_with(
        &self,
        name: &str,
        make: impl FnOnce() -> CircuitBreaker,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breaker(name) {
            return breaker;
        }
        self.update(|components| {
            components
                .breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(make()))
                .clone()
        })
    }

    /// Apply `change` to a copy of the current snapshot and publish it
    pub fn update<R>(&self, change: impl FnOnce(&mut Components) -> R) -> R {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = Components::clone(&self.current.load());
        let result = change(&mut next);
        self.current.store(Arc::new(next));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_recovery::circuit_breaker::CircuitBreakerConfig;

    #[test]
    fn test_readers_keep_old_snapshot() {
        let registry = ComponentRegistry::new();
        let before = registry.snapshot();

        registry.update(|c| {
            c.breakers.insert(
                "binance".to_string(),
                Arc::new(CircuitBreaker::new("binance", CircuitBreakerConfig::default())),
            );
        });

        assert!(before.breakers.is_empty());
        assert!(registry.breaker("binance").is_some());
        assert_eq!(registry.snapshot().names().len(), 1);
    }

    #[test]
    fn test_breaker_or_insert_with_is_idempotent() {
        let registry = ComponentRegistry::new();
        let first = registry.breaker_or_insert_with("s3", || {
            CircuitBreaker::new("s3", CircuitBreakerConfig::default())
        });
        let second = registry.breaker_or_insert_with("s3", || unreachable!());
        assert!(Arc::ptr_eq(&first, &second));
    }
}
