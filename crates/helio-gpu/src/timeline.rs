//! Per-queue submission timeline: monotonically increasing fence values, a
//! bounded ring of in-flight allocations, and reference counts that gate
//! reclamation.

use std::collections::{HashMap, VecDeque};

/// Reference counts per fence value. Pools and the submission ring hold a
/// reference for every arena or allocation still pinned to a value.
pub struct FenceLedger {
    refs: HashMap<u64, usize>,
}

impl Default for FenceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceLedger {
    pub fn new() -> Self {
        Self { refs: HashMap::new() }
    }

    pub fn add_ref(&mut self, fence_value: u64) {
        *self.refs.entry(fence_value).or_insert(0) += 1;
    }

    /// Drops one reference; returns true when the value reaches zero.
    pub fn release(&mut self, fence_value: u64) -> bool {
        match self.refs.get_mut(&fence_value) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.refs.remove(&fence_value);
                true
            }
            None => true,
        }
    }

    pub fn count(&self, fence_value: u64) -> usize {
        self.refs.get(&fence_value).copied().unwrap_or(0)
    }

    pub fn is_referenced(&self, fence_value: u64) -> bool {
        self.count(fence_value) > 0
    }
}

/// One submitted command buffer batch still owned by the GPU.
#[derive(Debug)]
pub struct LiveAllocation<C, E> {
    pub fence_value: u64,
    pub command_buffers: Vec<C>,
    pub events: Vec<E>,
}

/// Fence-value bookkeeping for one queue.
///
/// `C` is the backend command-buffer type and `E` the backend's split-barrier
/// event key; both stay opaque here so the ring's ordering rules are testable
/// without a device.
pub struct SubmissionRing<C, E> {
    next_fence_value: u64,
    live: VecDeque<LiveAllocation<C, E>>,
    max_live: usize,
}

impl<C, E> SubmissionRing<C, E> {
    pub fn new(max_live: usize) -> Self {
        Self {
            next_fence_value: 1,
            live: VecDeque::new(),
            max_live: max_live.max(1),
        }
    }

    /// The value the next submission will signal.
    pub fn next_fence_value(&self) -> u64 {
        self.next_fence_value
    }

    /// Last assigned fence value (0 before the first submission).
    pub fn current_fence_value(&self) -> u64 {
        self.next_fence_value - 1
    }

    /// True when the ring is at capacity and the caller must wait on
    /// [`SubmissionRing::oldest_fence`] before recording more work.
    pub fn is_full(&self) -> bool {
        self.live.len() >= self.max_live
    }

    pub fn oldest_fence(&self) -> Option<u64> {
        self.live.front().map(|a| a.fence_value)
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    /// Records a submitted batch. The batch must carry the value returned by
    /// [`SubmissionRing::next_fence_value`]; values are assigned in order.
    pub fn record(&mut self, allocation: LiveAllocation<C, E>, ledger: &mut FenceLedger) {
        assert_eq!(
            allocation.fence_value, self.next_fence_value,
            "submissions must signal consecutive fence values"
        );
        ledger.add_ref(allocation.fence_value);
        self.next_fence_value += 1;
        self.live.push_back(allocation);
    }

    /// Releases every retired head entry, handing each to `recycle` (command
    /// buffers back to their pool, events back to the event pool). Returns
    /// the number of entries reaped.
    pub fn reap(
        &mut self,
        completed_fence: u64,
        ledger: &mut FenceLedger,
        mut recycle: impl FnMut(LiveAllocation<C, E>),
    ) -> usize {
        let mut reaped = 0;
        while let Some(front) = self.live.front() {
            if front.fence_value > completed_fence {
                break;
            }
            let allocation = self.live.pop_front().unwrap();
            ledger.release(allocation.fence_value);
            recycle(allocation);
            reaped += 1;
        }
        reaped
    }

    /// Drains every live entry regardless of fence state; teardown only.
    pub fn drain(&mut self) -> Vec<LiveAllocation<C, E>> {
        self.live.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(fence_value: u64) -> LiveAllocation<u32, ()> {
        LiveAllocation { fence_value, command_buffers: vec![fence_value as u32], events: vec![] }
    }

    #[test]
    fn ledger_balances_references() {
        let mut ledger = FenceLedger::new();
        ledger.add_ref(3);
        ledger.add_ref(3);
        assert_eq!(ledger.count(3), 2);
        assert!(!ledger.release(3));
        assert!(ledger.is_referenced(3));
        assert!(ledger.release(3));
        assert_eq!(ledger.count(3), 0);
    }

    #[test]
    fn fence_values_are_monotonic_and_reaped_in_order() {
        let mut ring: SubmissionRing<u32, ()> = SubmissionRing::new(8);
        let mut ledger = FenceLedger::new();

        assert_eq!(ring.current_fence_value(), 0);
        for _ in 0..3 {
            let value = ring.next_fence_value();
            ring.record(alloc(value), &mut ledger);
        }
        assert_eq!(ring.current_fence_value(), 3);
        assert_eq!(ring.oldest_fence(), Some(1));

        let mut recycled = Vec::new();
        let reaped = ring.reap(2, &mut ledger, |a| recycled.push(a.fence_value));
        assert_eq!(reaped, 2);
        assert_eq!(recycled, vec![1, 2]);
        assert_eq!(ring.live_len(), 1);
        assert!(!ledger.is_referenced(1));
        assert!(!ledger.is_referenced(2));
        assert!(ledger.is_referenced(3));
    }

    #[test]
    fn ring_reports_full_at_capacity() {
        let mut ring: SubmissionRing<u32, ()> = SubmissionRing::new(2);
        let mut ledger = FenceLedger::new();
        ring.record(alloc(1), &mut ledger);
        assert!(!ring.is_full());
        ring.record(alloc(2), &mut ledger);
        assert!(ring.is_full());

        ring.reap(1, &mut ledger, |_| {});
        assert!(!ring.is_full());
    }

    #[test]
    #[should_panic(expected = "consecutive")]
    fn out_of_order_fence_values_are_rejected() {
        let mut ring: SubmissionRing<u32, ()> = SubmissionRing::new(2);
        let mut ledger = FenceLedger::new();
        ring.record(alloc(5), &mut ledger);
    }
}
