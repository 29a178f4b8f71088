use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use knc_wire_spec::WORK_ID_SPACE;

use crate::work::{Staleness, Urgency, WorkItem};

/// Upper bound on the learned capacity. Keeping it at half the id space
/// leaves room for in-flight work to retire before its id comes round again.
pub const MAX_QUEUE_CAPACITY: usize = WORK_ID_SPACE / 2;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub pruned: u64,
    pub flushed: u64,
}

pub struct WorkQueue {
    local: VecDeque<Arc<WorkItem>>,
    capacity: usize,
    full: bool,
    need_flush: bool,
    newest_inflight: Option<Arc<WorkItem>>,
    poll_request: Option<Instant>,
    stats: QueueStats,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            local: VecDeque::new(),
            capacity: 1,
            full: false,
            need_flush: false,
            newest_inflight: None,
            poll_request: None,
            stats: QueueStats::default(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.local.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn is_full(&self) -> bool {
        self.full
    }

    #[cfg(test)]
    pub fn need_flush(&self) -> bool {
        self.need_flush
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn append(&mut self, work: Arc<WorkItem>, staleness: &dyn Staleness) -> bool {
        if self.local.len() >= self.capacity {
            self.prune(staleness);
            if self.full {
                self.stats.rejected += 1;
                return false;
            }
        }

        self.local.push_back(work);
        self.stats.enqueued += 1;

        self.full = self.local.len() >= self.capacity;
        if self.full {
            self.prune(staleness);
        }
        true
    }

    pub fn prune(&mut self, staleness: &dyn Staleness) -> usize {
        let before = self.local.len();
        self.local
            .retain(|work| !staleness.is_stale(work, Urgency::Relaxed));
        let pruned = before - self.local.len();
        self.stats.pruned += pruned as u64;
        self.full = self.local.len() >= self.capacity;
        pruned
    }

    /// Empties the local queue. If the newest work the hardware holds is
    /// urgent-stale, arms a hardware flush and asks for an immediate poll;
    /// returns whether it did.
    pub fn flush(&mut self, staleness: &dyn Staleness) -> bool {
        self.stats.flushed += self.local.len() as u64;
        self.local.clear();
        self.full = false;

        let stale_inflight = self
            .newest_inflight
            .as_ref()
            .is_some_and(|work| staleness.is_stale(work, Urgency::Urgent));
        if stale_inflight {
            self.need_flush = true;
            self.poll_request = Some(Instant::now());
        }
        stale_inflight
    }

    pub fn snapshot(&self) -> Vec<Arc<WorkItem>> {
        self.local.iter().cloned().collect()
    }

    pub fn take_need_flush(&mut self) -> bool {
        std::mem::take(&mut self.need_flush)
    }

    pub fn rearm_flush(&mut self) {
        self.need_flush = true;
    }

    /// Learns from the hardware's accept count. Returns whether the next
    /// poll should run immediately.
    pub fn observe_accepted(&mut self, accepted: u16) -> bool {
        let accepted = usize::from(accepted);
        if accepted < self.capacity {
            return false;
        }
        self.capacity = accepted.min(MAX_QUEUE_CAPACITY).max(self.capacity);
        true
    }

    /// Removes accepted items from the local queue. Items already gone
    /// (flushed or pruned while the transfer was running) are skipped.
    pub fn remove_accepted(&mut self, accepted: &[Arc<WorkItem>]) {
        for work in accepted {
            if let Some(pos) = self.local.iter().position(|queued| Arc::ptr_eq(queued, work)) {
                self.local.remove(pos);
            }
        }
        self.full = self.local.len() >= self.capacity;
    }

    pub fn set_newest_inflight(&mut self, work: Option<Arc<WorkItem>>) {
        self.newest_inflight = work;
    }

    pub fn request_poll(&mut self, due: Instant) {
        self.poll_request = Some(match self.poll_request {
            Some(existing) => existing.min(due),
            None => due,
        });
    }

    pub fn poll_request(&self) -> Option<Instant> {
        self.poll_request
    }

    pub fn settle_poll_request(&mut self, now: Instant) {
        if self.poll_request.is_some_and(|due| due <= now) {
            self.poll_request = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::work::{test_work, EpochClock};

    fn item(seed: u8, epoch: u64) -> Arc<WorkItem> {
        Arc::new(test_work(seed, epoch))
    }

    #[test]
    fn append_rejects_once_capacity_is_reached() {
        let clock = EpochClock::new(1);
        let mut queue = WorkQueue::new();

        assert!(queue.append(item(1, 1), &clock));
        assert!(queue.is_full());
        assert!(!queue.append(item(2, 1), &clock));
        assert!(!queue.append(item(3, 1), &clock));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().rejected, 2);
    }

    #[test]
    fn append_prunes_stale_work_before_rejecting() {
        let clock = EpochClock::new(1);
        let mut queue = WorkQueue::new();
        assert!(queue.append(item(1, 1), &clock));

        clock.advance(2, true);
        assert!(queue.append(item(2, 2), &clock));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot()[0].freshness.epoch, 2);
        assert_eq!(queue.stats().pruned, 1);
    }

    #[test]
    fn flush_arms_hardware_flush_only_for_urgent_stale_inflight_work() {
        let clock = EpochClock::new(1);
        let mut queue = WorkQueue::new();
        queue.set_newest_inflight(Some(item(1, 1)));
        assert!(queue.append(item(2, 1), &clock));

        clock.advance(2, true);
        assert!(!queue.flush(&clock));
        assert!(queue.is_empty());
        assert!(!queue.need_flush());

        clock.advance(3, false);
        assert!(queue.flush(&clock));
        assert!(queue.need_flush());
        assert!(queue.poll_request().is_some());
    }

    #[test]
    fn flush_is_idempotent() {
        let clock = EpochClock::new(1);
        let mut queue = WorkQueue::new();
        queue.set_newest_inflight(Some(item(1, 1)));
        queue.append(item(2, 1), &clock);
        clock.advance(2, false);

        let first = queue.flush(&clock);
        let after_first = (queue.len(), queue.need_flush(), queue.is_full());
        let second = queue.flush(&clock);
        let after_second = (queue.len(), queue.need_flush(), queue.is_full());

        assert_eq!(first, second);
        assert_eq!(after_first, after_second);
        assert_eq!(queue.stats().flushed, 1);
    }

    #[test]
    fn capacity_only_grows() {
        let mut queue = WorkQueue::new();
        assert!(queue.observe_accepted(1));
        assert_eq!(queue.capacity(), 1);
        assert!(queue.observe_accepted(8));
        assert_eq!(queue.capacity(), 8);
        assert!(!queue.observe_accepted(3));
        assert_eq!(queue.capacity(), 8);
        assert!(queue.observe_accepted(u16::MAX));
        assert_eq!(queue.capacity(), MAX_QUEUE_CAPACITY);
    }

    #[test]
    fn remove_accepted_skips_items_dropped_meanwhile() {
        let clock = EpochClock::new(1);
        let mut queue = WorkQueue::new();
        queue.observe_accepted(4);
        let a = item(1, 1);
        let b = item(2, 1);
        let c = item(3, 1);
        for work in [&a, &b, &c] {
            assert!(queue.append(Arc::clone(work), &clock));
        }
        queue.remove_accepted(&[Arc::clone(&a), item(9, 1)]);
        let left = queue.snapshot();
        assert_eq!(left.len(), 2);
        assert!(Arc::ptr_eq(&left[0], &b));
        assert!(Arc::ptr_eq(&left[1], &c));
    }

    #[test]
    fn poll_requests_keep_the_earliest_due_time() {
        let mut queue = WorkQueue::new();
        let now = Instant::now();
        let later = now + std::time::Duration::from_millis(50);
        queue.request_poll(later);
        queue.request_poll(now);
        queue.request_poll(later);
        assert_eq!(queue.poll_request(), Some(now));

        queue.settle_poll_request(now);
        assert_eq!(queue.poll_request(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u64),
        Prune,
        Flush,
        Accept(u16),
        Advance,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u64..3).prop_map(Op::Enqueue),
            1 => Just(Op::Prune),
            1 => Just(Op::Flush),
            2 => (0u16..40).prop_map(Op::Accept),
            1 => Just(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn local_queue_never_exceeds_capacity_after_prune(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let clock = EpochClock::new(2);
            let mut queue = WorkQueue::new();
            let mut seed = 0u8;
            for op in ops {
                let capacity_before = queue.capacity();
                match op {
                    Op::Enqueue(age) => {
                        seed = seed.wrapping_add(1);
                        let epoch = clock.current().saturating_sub(age);
                        queue.append(item(seed, epoch), &clock);
                    }
                    Op::Prune => {
                        queue.prune(&clock);
                    }
                    Op::Flush => {
                        queue.flush(&clock);
                    }
                    Op::Accept(accepted) => {
                        queue.observe_accepted(accepted);
                        let sent = queue.snapshot();
                        let take = usize::from(accepted).min(sent.len());
                        queue.remove_accepted(&sent[..take]);
                    }
                    Op::Advance => clock.advance(clock.current() + 1, true),
                }
                prop_assert!(queue.capacity() >= capacity_before);
                queue.prune(&clock);
                prop_assert!(queue.len() <= queue.capacity());
                prop_assert_eq!(queue.is_full(), queue.len() >= queue.capacity());
            }
        }
    }
}
