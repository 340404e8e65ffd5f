//! Per-operation request counters backing the RpcStat method

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use crate::rpc::types::StatOp;

#[derive(Default)]
struct OpSlot {
    total: AtomicI64,
    /// Snapshot of `total` at the last roll.
    rolled: AtomicI64,
    /// Requests observed in the last completed interval.
    current: AtomicI64,
}

/// Lock-free request counters. `roll()` is driven by a 1 s ticker; between
/// rolls, `current` reports the last completed interval.
pub struct PerfCounter {
    started: Instant,
    slots: [OpSlot; 8],
}

impl PerfCounter {
    pub fn new() -> Self {
        PerfCounter {
            started: Instant::now(),
            slots: Default::default(),
        }
    }

    fn slot(&self, op: StatOp) -> &OpSlot {
        let index = StatOp::ALL
            .iter()
            .position(|candidate| *candidate == op)
            .expect("every stat op is indexed");
        &self.slots[index]
    }

    pub fn record(&self, op: StatOp) {
        self.slot(op).total.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current interval: remember the delta since the last roll.
    pub fn roll(&self) {
        for slot in &self.slots {
            let total = slot.total.load(Ordering::Relaxed);
            let rolled = slot.rolled.swap(total, Ordering::Relaxed);
            slot.current.store(total - rolled, Ordering::Relaxed);
        }
    }

    /// Requests in the last completed interval.
    pub fn current(&self, op: StatOp) -> i64 {
        self.slot(op).current.load(Ordering::Relaxed)
    }

    /// Lifetime requests per second.
    pub fn average(&self, op: StatOp) -> i64 {
        let elapsed = self.started.elapsed().as_secs().max(1) as i64;
        self.slot(op).total.load(Ordering::Relaxed) / elapsed
    }
}

impl Default for PerfCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_captures_interval() {
        let perf = PerfCounter::new();
        perf.record(StatOp::Put);
        perf.record(StatOp::Put);
        perf.record(StatOp::Get);
        assert_eq!(perf.current(StatOp::Put), 0);

        perf.roll();
        assert_eq!(perf.current(StatOp::Put), 2);
        assert_eq!(perf.current(StatOp::Get), 1);
        assert_eq!(perf.current(StatOp::Lock), 0);

        perf.roll();
        assert_eq!(perf.current(StatOp::Put), 0);
    }

    #[test]
    fn test_average_counts_lifetime() {
        let perf = PerfCounter::new();
        for _ in 0..10 {
            perf.record(StatOp::Scan);
        }
        // under a second of uptime, the divisor clamps to one
        assert_eq!(perf.average(StatOp::Scan), 10);
    }
}
