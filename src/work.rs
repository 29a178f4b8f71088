use std::sync::atomic::{AtomicU64, Ordering};

use knc_wire_spec::{DATA_LEN, DATA_TAIL_LEN, DATA_TAIL_OFFSET, MIDSTATE_LEN};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Freshness {
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub midstate: [u8; MIDSTATE_LEN],
    pub data: [u8; DATA_LEN],
    pub freshness: Freshness,
}

impl WorkItem {
    pub fn new(midstate: [u8; MIDSTATE_LEN], data: [u8; DATA_LEN], epoch: u64) -> Self {
        Self {
            midstate,
            data,
            freshness: Freshness { epoch },
        }
    }

    pub fn data_tail(&self) -> &[u8] {
        &self.data[DATA_TAIL_OFFSET..DATA_TAIL_OFFSET + DATA_TAIL_LEN]
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Urgency {
    /// Pruning before a send: anything the scheduler has moved past.
    Relaxed,
    /// Deciding whether to make the hardware abandon what it holds.
    Urgent,
}

pub trait Staleness: Send + Sync {
    fn is_stale(&self, work: &WorkItem, urgency: Urgency) -> bool;
}

#[derive(Debug, Default)]
pub struct EpochClock {
    current: AtomicU64,
    submit_floor: AtomicU64,
}

impl EpochClock {
    pub fn new(epoch: u64) -> Self {
        Self {
            current: AtomicU64::new(epoch),
            submit_floor: AtomicU64::new(epoch),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Moves to `epoch`. With `keep_old_submittable` the previous epochs
    /// stay submittable (a soft refresh); otherwise they become urgent-stale.
    pub fn advance(&self, epoch: u64, keep_old_submittable: bool) {
        self.current.store(epoch, Ordering::Release);
        if !keep_old_submittable {
            self.submit_floor.store(epoch, Ordering::Release);
        }
    }
}

impl Staleness for EpochClock {
    fn is_stale(&self, work: &WorkItem, urgency: Urgency) -> bool {
        match urgency {
            Urgency::Relaxed => work.freshness.epoch < self.current.load(Ordering::Acquire),
            Urgency::Urgent => work.freshness.epoch < self.submit_floor.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_work(seed: u8, epoch: u64) -> WorkItem {
    let mut midstate = [0u8; MIDSTATE_LEN];
    for (i, byte) in midstate.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
    let mut data = [0u8; DATA_LEN];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(37).wrapping_add(11).wrapping_add(seed);
    }
    WorkItem::new(midstate, data, epoch)
}
