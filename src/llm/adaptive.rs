//! Additive-increase / multiplicative-decrease concurrency control over
//! model requests. A rate limit halves the in-flight cap immediately; a
//! long streak of successes raises it back one slot at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const ACQUIRE_POLL: Duration = Duration::from_millis(20);
const MIN_RAISE_STREAK: usize = 8;

#[derive(Debug)]
pub struct AdaptiveConcurrency {
    enabled: bool,
    max: usize,
    limit: AtomicUsize,
    inflight: AtomicUsize,
    success_streak: AtomicUsize,
}

impl AdaptiveConcurrency {
    /// Only meaningful above one worker; single-worker runs get a no-op.
    pub fn new(max_concurrency: usize, enabled: bool) -> Self {
        let max = max_concurrency.max(1);
        Self {
            enabled: enabled && max > 1,
            max,
            limit: AtomicUsize::new(max),
            inflight: AtomicUsize::new(0),
            success_streak: AtomicUsize::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Waits until an in-flight slot is available under the current limit.
    pub async fn acquire(&self) {
        if !self.enabled {
            return;
        }
        loop {
            let limit = self.limit.load(Ordering::Acquire);
            let inflight = self.inflight.load(Ordering::Acquire);
            if inflight < limit
                && self
                    .inflight
                    .compare_exchange(inflight, inflight + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    pub fn release(&self) {
        if !self.enabled {
            return;
        }
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Halves the limit (floor 1, always at least one slot lower) and
    /// resets the success streak.
    pub fn on_rate_limit(&self) {
        if !self.enabled {
            return;
        }
        let mut current = self.limit.load(Ordering::Acquire);
        loop {
            let lowered = std::cmp::max(1, std::cmp::min(current.saturating_sub(1), current / 2));
            if lowered >= current {
                break;
            }
            match self.limit.compare_exchange(
                current,
                lowered,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::warn!(from = current, to = lowered, "adaptive limit lowered");
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        self.success_streak.store(0, Ordering::Release);
    }

    /// Counts a clean request; enough of them in a row raise the limit by
    /// one, never above the configured maximum.
    pub fn on_success(&self) {
        if !self.enabled {
            return;
        }
        let limit = self.limit.load(Ordering::Acquire);
        if limit >= self.max {
            self.success_streak.store(0, Ordering::Release);
            return;
        }
        let streak = self.success_streak.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = std::cmp::max(MIN_RAISE_STREAK, limit * MIN_RAISE_STREAK);
        if streak >= threshold
            && self
                .success_streak
                .compare_exchange(streak, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let raised = std::cmp::min(self.max, limit + 1);
            if raised > limit
                && self
                    .limit
                    .compare_exchange(limit, raised, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tracing::info!(from = limit, to = raised, "adaptive limit raised");
            }
        }
    }
}
