//! Refork policy: when to advance a generation, and which worker becomes
//! the next mold.
//!
//! `refork_after = [T1, T2, …]` gives per-generation request thresholds.
//! When any worker of generation `g` has served `T[g]` requests since it
//! was forked, the policy fires: a mold candidate is selected (by default
//! the worker with the most private resident memory), promoted, and the
//! whole pool is respawned from it as generation `g + 1`.
//!
//! This module is pure bookkeeping over worker snapshots; the process
//! plumbing lives in the supervisor.

use crate::memstats::MemStats;

/// Point-in-time view of one worker, as handed to the selector.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    /// Slot number.
    pub nr: u32,
    /// Process id.
    pub pid: u32,
    /// Generation the worker was forked into.
    pub generation: u64,
    /// Requests served since fork.
    pub requests: u64,
    /// Memory stats, when readable.
    pub mem: Option<MemStats>,
}

/// Chooses the worker to promote. Returns the chosen slot number.
pub type MoldSelector = dyn Fn(&[WorkerSnapshot]) -> Option<u32> + Send + Sync;

/// Default selector: the largest private resident memory wins; ties and
/// missing stats fall back to the highest request count.
#[must_use]
pub fn default_mold_selector(workers: &[WorkerSnapshot]) -> Option<u32> {
    workers
        .iter()
        .max_by_key(|w| (w.mem.map(|m| m.private_kb).unwrap_or(0), w.requests))
        .map(|w| w.nr)
}

/// Generation-threshold bookkeeping.
#[derive(Debug, Clone)]
pub struct ReforkPolicy {
    thresholds: Vec<u64>,
}

impl ReforkPolicy {
    /// Build from the configured threshold list. Empty disables reforking.
    #[must_use]
    pub fn new(refork_after: Vec<u64>) -> Self {
        Self {
            thresholds: refork_after,
        }
    }

    /// The request threshold that moves generation `g` to `g + 1`, if any.
    #[must_use]
    pub fn threshold_for(&self, generation: u64) -> Option<u64> {
        usize::try_from(generation)
            .ok()
            .and_then(|g| self.thresholds.get(g).copied())
    }

    /// True when reforking can still happen past `generation`.
    #[must_use]
    pub fn active(&self, generation: u64) -> bool {
        self.threshold_for(generation).is_some()
    }

    /// Whether any current-generation worker has crossed its threshold.
    #[must_use]
    pub fn should_refork(&self, generation: u64, workers: &[WorkerSnapshot]) -> bool {
        let Some(threshold) = self.threshold_for(generation) else {
            return false;
        };
        workers
            .iter()
            .any(|w| w.generation == generation && w.requests >= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(nr: u32, generation: u64, requests: u64, private_kb: u64) -> WorkerSnapshot {
        WorkerSnapshot {
            nr,
            pid: 1000 + nr,
            generation,
            requests,
            mem: Some(MemStats {
                rss_kb: private_kb * 2,
                pss_kb: private_kb,
                private_kb,
            }),
        }
    }

    #[test]
    fn fires_when_any_worker_crosses() {
        let policy = ReforkPolicy::new(vec![5, 10]);
        let workers = vec![worker(0, 0, 3, 100), worker(1, 0, 5, 100)];
        assert!(policy.should_refork(0, &workers));
    }

    #[test]
    fn does_not_fire_below_threshold() {
        let policy = ReforkPolicy::new(vec![5]);
        let workers = vec![worker(0, 0, 4, 100), worker(1, 0, 4, 100)];
        assert!(!policy.should_refork(0, &workers));
    }

    #[test]
    fn stale_generation_counters_are_ignored() {
        let policy = ReforkPolicy::new(vec![5, 5]);
        // An old-generation worker still draining does not trigger gen 1.
        let workers = vec![worker(0, 0, 50, 100), worker(1, 1, 1, 100)];
        assert!(!policy.should_refork(1, &workers));
    }

    #[test]
    fn exhausted_thresholds_disable_reforking() {
        let policy = ReforkPolicy::new(vec![5]);
        let workers = vec![worker(0, 1, 1_000_000, 100)];
        assert!(!policy.should_refork(1, &workers));
        assert!(!policy.active(1));
        assert!(policy.active(0));
    }

    #[test]
    fn empty_thresholds_never_fire() {
        let policy = ReforkPolicy::new(Vec::new());
        let workers = vec![worker(0, 0, u64::MAX, 100)];
        assert!(!policy.should_refork(0, &workers));
    }

    #[test]
    fn selector_prefers_private_memory() {
        let workers = vec![
            worker(0, 0, 100, 50),
            worker(1, 0, 10, 500),
            worker(2, 0, 200, 80),
        ];
        assert_eq!(default_mold_selector(&workers), Some(1));
    }

    #[test]
    fn selector_falls_back_to_requests() {
        let mut workers = vec![worker(0, 0, 10, 0), worker(1, 0, 30, 0)];
        workers[0].mem = None;
        workers[1].mem = None;
        assert_eq!(default_mold_selector(&workers), Some(1));
    }

    #[test]
    fn selector_on_empty_pool() {
        assert_eq!(default_mold_selector(&[]), None);
    }
}
