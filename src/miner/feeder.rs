use std::sync::Arc;
use std::time::{Duration, Instant};

use knc_wire_spec::{DATA_LEN, DATA_TAIL_OFFSET, MIDSTATE_LEN};
use log::info;

use crate::device::WorkDevice;
use crate::work::{EpochClock, WorkItem};

const TOP_UP_LIMIT: usize = 256;

pub struct Feeder {
    clock: Arc<EpochClock>,
    epoch_interval: Duration,
    soft_refresh: bool,
    next_epoch_at: Instant,
    seq: u64,
    held: Option<Arc<WorkItem>>,
    generated: u64,
}

impl Feeder {
    pub fn new(clock: Arc<EpochClock>, epoch_interval: Duration, soft_refresh: bool) -> Self {
        Self {
            clock,
            epoch_interval,
            soft_refresh,
            next_epoch_at: Instant::now() + epoch_interval,
            seq: 0,
            held: None,
            generated: 0,
        }
    }

    pub fn next_epoch_at(&self) -> Instant {
        self.next_epoch_at
    }

    pub fn epoch(&self) -> u64 {
        self.clock.current()
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    pub fn tick<D: WorkDevice>(&mut self, now: Instant, devices: &[D]) -> bool {
        if now < self.next_epoch_at {
            return false;
        }
        let epoch = self.clock.current() + 1;
        self.clock.advance(epoch, self.soft_refresh);
        self.held = None;
        for device in devices {
            device.flush_all();
        }
        self.next_epoch_at = now + self.epoch_interval;
        info!(
            "epoch {epoch} ({} refresh)",
            if self.soft_refresh { "soft" } else { "hard" }
        );
        true
    }

    /// Offers work to each device until it pushes back. A rejected item is
    /// kept for the next offer. Returns how many items were taken.
    pub fn top_up<D: WorkDevice>(&mut self, devices: &[D]) -> usize {
        let mut taken = 0;
        for device in devices {
            let before = taken;
            for _ in 0..TOP_UP_LIMIT {
                let work = match self.held.take() {
                    Some(work) => work,
                    None => self.make_work(),
                };
                if !device.enqueue(Arc::clone(&work)) {
                    self.held = Some(work);
                    break;
                }
                taken += 1;
            }
            if taken > before {
                device.poll_now();
            }
        }
        taken
    }

    fn make_work(&mut self) -> Arc<WorkItem> {
        let epoch = self.clock.current();
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.generated += 1;

        let mut midstate = [0u8; MIDSTATE_LEN];
        for (i, byte) in midstate.iter_mut().enumerate() {
            *byte = (i as u8)
                .wrapping_mul(31)
                .wrapping_add(7)
                .wrapping_add(epoch as u8);
        }
        let mut data = [0u8; DATA_LEN];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        data[DATA_TAIL_OFFSET..DATA_TAIL_OFFSET + 8].copy_from_slice(&seq.to_le_bytes());
        Arc::new(WorkItem::new(midstate, data, epoch))
    }
}
