//! Per-identifier sliding-window rate limiting.
//!
//! Process-wide state with a documented lifecycle: created once in
//! `AppState`, garbage-collected lazily when the key map grows large.
//! Identifiers are API-key prefixes when present, client addresses
//! otherwise.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Route classes with their per-minute budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Generic,
    AdminMutation,
    SuffixBatch,
}

impl RouteClass {
    pub fn limit(&self) -> usize {
        match self {
            RouteClass::Generic => 100,
            RouteClass::AdminMutation => 20,
            RouteClass::SuffixBatch => 30,
        }
    }
}

const WINDOW: Duration = Duration::from_secs(60);

/// Above this many tracked keys a check pass also drops empty windows.
const GC_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until the oldest hit leaves the window.
    pub reset_secs: u64,
}

pub struct RateLimiter {
    hits: Mutex<HashMap<(RouteClass, String), VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record one hit and decide. Denied hits are not recorded, so a
    /// hammering client recovers as its window drains.
    pub fn check(&self, class: RouteClass, identifier: &str) -> RateDecision {
        let now = Instant::now();
        let limit = class.limit();
        let mut map = self.hits.lock().unwrap_or_else(|p| p.into_inner());

        if map.len() > GC_THRESHOLD {
            map.retain(|_, q| q.back().map(|t| now - *t < WINDOW).unwrap_or(false));
        }

        let queue = map
            .entry((class, identifier.to_string()))
            .or_insert_with(VecDeque::new);
        while queue.front().map(|t| now - *t >= WINDOW).unwrap_or(false) {
            queue.pop_front();
        }

        let reset_secs = queue
            .front()
            .map(|t| WINDOW.saturating_sub(now - *t).as_secs() + 1)
            .unwrap_or(0);

        if queue.len() >= limit {
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_secs,
            };
        }

        queue.push_back(now);
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - queue.len(),
            reset_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_then_denies() {
        let limiter = RateLimiter::new();
        for i in 0..RouteClass::AdminMutation.limit() {
            let d = limiter.check(RouteClass::AdminMutation, "ky_test_abc");
            assert!(d.allowed, "hit {i} should pass");
        }
        let denied = limiter.check(RouteClass::AdminMutation, "ky_test_abc");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_secs > 0);
    }

    #[test]
    fn identifiers_and_classes_are_isolated() {
        let limiter = RateLimiter::new();
        for _ in 0..RouteClass::AdminMutation.limit() {
            limiter.check(RouteClass::AdminMutation, "a");
        }
        assert!(!limiter.check(RouteClass::AdminMutation, "a").allowed);
        assert!(
            limiter.check(RouteClass::AdminMutation, "b").allowed,
            "other identifiers unaffected"
        );
        assert!(
            limiter.check(RouteClass::Generic, "a").allowed,
            "other classes unaffected"
        );
    }
}
