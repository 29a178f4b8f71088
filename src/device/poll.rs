use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use knc_wire_spec::TRANSACTION_LEN;
use log::{debug, info, warn};

use super::cores::CoreMap;
use super::dispatch::{dispatch_replies, DispatchSummary};
use super::events::EventSink;
use super::queue::WorkQueue;
use super::table::DeviceTable;
use crate::bus::{BusTransport, TransferBuffers};
use crate::codec::{bring_up_flush, decode_header, encode_flush, encode_submission};
use crate::work::Staleness;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PollOutcome {
    pub delay: Duration,
    pub transport_ok: bool,
    pub flushed: bool,
    pub sent: usize,
    pub accepted: u16,
    pub overflow: bool,
    pub dispatch: DispatchSummary,
}

pub struct PollController {
    name: String,
    queue: Arc<Mutex<WorkQueue>>,
    staleness: Arc<dyn Staleness>,
    cores: Arc<CoreMap>,
    events: EventSink,
    table: DeviceTable,
    buffers: TransferBuffers,
    poll_interval: Duration,
}

impl PollController {
    pub fn new(
        name: String,
        queue: Arc<Mutex<WorkQueue>>,
        staleness: Arc<dyn Staleness>,
        cores: Arc<CoreMap>,
        events: EventSink,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name,
            queue,
            staleness,
            cores,
            events,
            table: DeviceTable::new(),
            buffers: TransferBuffers::new(TRANSACTION_LEN),
            poll_interval,
        }
    }

    #[cfg(test)]
    pub fn table(&self) -> &DeviceTable {
        &self.table
    }

    fn lock_queue(&self) -> Result<MutexGuard<'_, WorkQueue>> {
        lock_queue(&self.queue, &self.name)
    }

    pub fn bring_up(&mut self, bus: &mut dyn BusTransport) -> Result<()> {
        self.buffers.clear();
        self.buffers.emit(&bring_up_flush());
        debug!(
            "{}: issuing flush command to clear out device queues",
            self.name
        );
        self.buffers
            .transact(bus)
            .map_err(|err| anyhow!("{}: bring-up flush failed: {err}", self.name))?;
        self.lock_queue()?.request_poll(Instant::now());
        Ok(())
    }

    /// Runs one poll cycle. Errors only on a poisoned queue lock; a failed
    /// transfer is reported through `PollOutcome::transport_ok`.
    pub fn poll_once(&mut self, bus: &mut dyn BusTransport) -> Result<PollOutcome> {
        let mut outcome = PollOutcome {
            delay: self.poll_interval,
            ..PollOutcome::default()
        };

        let (flushing, pending) = {
            let mut queue = self.lock_queue()?;
            queue.settle_poll_request(Instant::now());
            queue.prune(self.staleness.as_ref());
            (queue.take_need_flush(), queue.snapshot())
        };

        self.buffers.clear();
        if flushing {
            info!("{}: abandoning stale searches to restart", self.name);
            self.buffers.emit(&encode_flush());
        }
        let mut sent = Vec::with_capacity(pending.len());
        for work in pending {
            let id = self.table.speculative_id(sent.len());
            if !self.buffers.emit(&encode_submission(id, &work)) {
                break;
            }
            sent.push(work);
        }
        outcome.sent = sent.len();

        if let Err(err) = self.buffers.transact(bus) {
            debug!("{}: transfer failed: {err}", self.name);
            if flushing {
                self.lock_queue()?.rearm_flush();
            }
            return Ok(outcome);
        }
        outcome.transport_ok = true;

        let header = decode_header(self.buffers.rx());
        outcome.accepted = header.accepted;
        outcome.overflow = header.overflow;
        if header.overflow {
            debug!("{}: receive buffer overflow reported", self.name);
        }

        outcome.dispatch = dispatch_replies(
            &self.name,
            self.buffers.rx(),
            &mut self.table,
            &self.cores,
            &self.events,
        );

        if flushing {
            let dropped = self.table.clear();
            debug!("{}: dropped {dropped} flushed searches", self.name);
            outcome.flushed = true;
            outcome.delay = Duration::ZERO;
        }

        let mut queue = lock_queue(&self.queue, &self.name)?;
        debug!(
            "{}: {}/{} jobs accepted to queue (max={}, in flight={})",
            self.name,
            header.accepted,
            outcome.sent,
            queue.capacity(),
            self.table.len()
        );
        if header.accepted > 0 {
            if queue.observe_accepted(header.accepted) {
                outcome.delay = Duration::ZERO;
            }
            let take = usize::from(header.accepted).min(sent.len());
            let accepted = &sent[..take];
            queue.remove_accepted(accepted);
            for work in accepted {
                let (id, displaced) = self.table.insert_next(Arc::clone(work));
                if displaced.is_some() {
                    warn!(
                        "{}: work id {id:#06x} reissued while still in flight",
                        self.name
                    );
                }
            }
        }
        queue.set_newest_inflight(self.table.newest().cloned());

        Ok(outcome)
    }
}

fn lock_queue<'a>(queue: &'a Mutex<WorkQueue>, name: &str) -> Result<MutexGuard<'a, WorkQueue>> {
    queue
        .lock()
        .map_err(|_| anyhow!("{name}: work queue lock poisoned"))
}
