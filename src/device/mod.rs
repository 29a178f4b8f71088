use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::bus::BusTransport;
use crate::work::{Staleness, WorkItem};

pub mod cores;
mod dispatch;
mod events;
mod poll;
pub mod queue;
mod table;

use cores::{CoreId, CoreMap};
use events::EventSink;
use poll::PollController;
use queue::{QueueStats, WorkQueue};

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Nonce {
        core: CoreId,
        work: Arc<WorkItem>,
        nonce: u32,
    },
    Completed {
        core: CoreId,
        hashes: u64,
    },
    HardwareError {
        core: Option<CoreId>,
        nonce: Option<u32>,
    },
    Error {
        device: String,
        message: String,
    },
}

pub trait WorkDevice: Send {
    fn name(&self) -> &str;

    fn cores(&self) -> usize;

    fn set_event_sink(&mut self, sink: Sender<DeviceEvent>);

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    /// Hands `work` to the device. `false` means the queue is full and the
    /// caller should hold on to it.
    fn enqueue(&self, work: Arc<WorkItem>) -> bool;

    fn flush_all(&self);

    fn poll_at(&self, due: Instant);

    fn poll_now(&self) {
        self.poll_at(Instant::now());
    }
}

const FAILURE_WARN_THRESHOLD: u32 = 100;

struct Shared {
    started: AtomicBool,
    shutdown: AtomicBool,
    queue: Arc<Mutex<WorkQueue>>,
    staleness: Arc<dyn Staleness>,
    events: EventSink,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Shared {
    fn wake(&self) {
        // A pending wake-up already covers this one.
        let _ = self.wake_tx.try_send(());
    }
}

/// One chain of KnC boards behind a single bus. The bus is moved into the
/// poll thread while the device runs and handed back when it stops.
pub struct KncDevice {
    name: String,
    cores: Arc<CoreMap>,
    poll_interval: Duration,
    shared: Arc<Shared>,
    bus: Option<Box<dyn BusTransport>>,
    worker: Option<JoinHandle<Box<dyn BusTransport>>>,
}

impl KncDevice {
    pub fn new(
        name: impl Into<String>,
        bus: Box<dyn BusTransport>,
        cores: CoreMap,
        staleness: Arc<dyn Staleness>,
        poll_interval: Duration,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            name: name.into(),
            cores: Arc::new(cores),
            poll_interval,
            shared: Arc::new(Shared {
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                queue: Arc::new(Mutex::new(WorkQueue::new())),
                staleness,
                events: EventSink::default(),
                wake_tx,
                wake_rx,
            }),
            bus: Some(bus),
            worker: None,
        }
    }

    pub fn core_map(&self) -> &CoreMap {
        &self.cores
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared
            .queue
            .lock()
            .map(|queue| queue.stats())
            .unwrap_or_default()
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared
            .queue
            .lock()
            .map(|queue| queue.capacity())
            .unwrap_or_default()
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.events.dropped()
    }
}

impl WorkDevice for KncDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn cores(&self) -> usize {
        self.cores.len()
    }

    fn set_event_sink(&mut self, sink: Sender<DeviceEvent>) {
        self.shared.events.set(sink);
    }

    fn start(&mut self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);

        let Some(mut bus) = self.bus.take() else {
            self.shared.started.store(false, Ordering::SeqCst);
            return Err(anyhow!("{}: bus was lost by an earlier run", self.name));
        };

        let mut controller = PollController::new(
            self.name.clone(),
            Arc::clone(&self.shared.queue),
            Arc::clone(&self.shared.staleness),
            Arc::clone(&self.cores),
            self.shared.events.clone(),
            self.poll_interval,
        );
        if let Err(err) = controller.bring_up(bus.as_mut()) {
            self.bus = Some(bus);
            self.shared.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let bus_name = bus.name().to_string();
        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("knc-poll-{}", self.name))
            .spawn(move || poll_loop(shared, controller, bus, name))
            .with_context(|| format!("{}: failed to spawn poll thread", self.name));
        match handle {
            Ok(handle) => {
                info!(
                    "{}: started on {bus_name} with {} cores ({} enabled)",
                    self.name,
                    self.cores.len(),
                    self.cores.enabled()
                );
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        if !self.shared.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake();

        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(bus) => self.bus = Some(bus),
                Err(_) => error!("{}: poll thread panicked", self.name),
            }
        }

        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.flush(self.shared.staleness.as_ref());
            queue.take_need_flush();
            queue.set_newest_inflight(None);
        }
    }

    fn enqueue(&self, work: Arc<WorkItem>) -> bool {
        match self.shared.queue.lock() {
            Ok(mut queue) => queue.append(work, self.shared.staleness.as_ref()),
            Err(_) => false,
        }
    }

    fn flush_all(&self) {
        let armed = match self.shared.queue.lock() {
            Ok(mut queue) => queue.flush(self.shared.staleness.as_ref()),
            Err(_) => false,
        };
        if armed {
            debug!("{}: in-flight work is stale, flushing hardware queue", self.name);
            self.shared.wake();
        }
    }

    fn poll_at(&self, due: Instant) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.request_poll(due);
        }
        self.shared.wake();
    }
}

impl Drop for KncDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
struct TransferHealth {
    failures: u32,
}

impl TransferHealth {
    fn record(&mut self, name: &str, ok: bool) {
        if ok {
            if self.failures >= FAILURE_WARN_THRESHOLD {
                info!(
                    "{name}: bus recovered after {} failed transfers",
                    self.failures
                );
            }
            self.failures = 0;
            return;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures == FAILURE_WARN_THRESHOLD {
            warn!("{name}: {} consecutive transfer failures", self.failures);
        }
    }
}

fn poll_loop(
    shared: Arc<Shared>,
    mut controller: PollController,
    mut bus: Box<dyn BusTransport>,
    name: String,
) -> Box<dyn BusTransport> {
    let mut next_poll = Instant::now();
    let mut health = TransferHealth::default();

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let requested = match shared.queue.lock() {
            Ok(queue) => queue.poll_request(),
            Err(_) => {
                shared
                    .events
                    .report_error(&name, "work queue lock poisoned".to_string());
                break;
            }
        };
        let due = requested.map_or(next_poll, |requested| requested.min(next_poll));
        let now = Instant::now();
        if due > now {
            match shared.wake_rx.recv_timeout(due - now) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        match controller.poll_once(bus.as_mut()) {
            Ok(outcome) => {
                health.record(&name, outcome.transport_ok);
                next_poll = Instant::now() + outcome.delay;
            }
            Err(err) => {
                error!("{name}: poll thread stopping: {err:#}");
                shared.events.report_error(&name, format!("{err:#}"));
                break;
            }
        }
    }

    debug!("{name}: poll thread exiting");
    bus
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::bus::sim::{SimConfig, SimulatedBus};
    use crate::bus::BusError;
    use crate::work::{test_work, EpochClock};

    fn sim_device(config: SimConfig, clock: Arc<EpochClock>) -> KncDevice {
        let mut builder = cores::CoreMapBuilder::new();
        for (asic, count) in &config.boards {
            builder
                .push_board(*asic, &vec![3u8; *count as usize])
                .expect("board registers");
        }
        KncDevice::new(
            "sim0",
            Box::new(SimulatedBus::new(config)),
            builder.build(),
            clock,
            Duration::from_millis(1),
        )
    }

    #[test]
    fn threaded_device_completes_work_from_the_simulator() {
        let clock = Arc::new(EpochClock::new(1));
        let mut device = sim_device(SimConfig::default(), Arc::clone(&clock));
        let (tx, rx) = unbounded();
        device.set_event_sink(tx);
        device.start().expect("sim device starts");

        let work = Arc::new(test_work(4, 1));
        assert!(device.enqueue(Arc::clone(&work)));
        device.poll_now();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut completed = 0;
        while completed == 0 && Instant::now() < deadline {
            if let Ok(DeviceEvent::Completed { hashes, .. }) =
                rx.recv_timeout(Duration::from_millis(50))
            {
                completed += 1;
                assert_eq!(hashes, knc_wire_spec::HASHES_PER_WORK);
            }
        }
        device.stop();
        assert_eq!(completed, 1);
        assert_eq!(device.queue_stats().enqueued, 1);
    }

    #[test]
    fn device_restarts_after_stop() {
        let clock = Arc::new(EpochClock::new(1));
        let mut device = sim_device(SimConfig::default(), clock);
        device.start().expect("first start");
        device.stop();
        device.start().expect("bus was handed back");
        device.stop();
    }

    #[test]
    fn flush_all_without_inflight_work_only_empties_the_queue() {
        let clock = Arc::new(EpochClock::new(1));
        let device = sim_device(SimConfig::default(), Arc::clone(&clock));
        assert!(device.enqueue(Arc::new(test_work(1, 1))));
        device.flush_all();
        device.flush_all();
        let stats = device.queue_stats();
        assert_eq!(stats.flushed, 1);
        assert!(device.enqueue(Arc::new(test_work(2, 1))));
    }

    #[test]
    fn transfer_failure_count_saturates_and_resets() {
        let mut health = TransferHealth::default();
        for _ in 0..FAILURE_WARN_THRESHOLD {
            health.record("knc0", false);
        }
        assert_eq!(health.failures, FAILURE_WARN_THRESHOLD);

        health.failures = u32::MAX - 1;
        health.record("knc0", false);
        health.record("knc0", false);
        assert_eq!(health.failures, u32::MAX);

        health.record("knc0", true);
        assert_eq!(health.failures, 0);
    }

    struct DeadBus;

    impl BusTransport for DeadBus {
        fn name(&self) -> &str {
            "dead"
        }

        fn transact(&mut self, _tx: &[u8], _rx: &mut [u8]) -> Result<(), BusError> {
            Err(BusError::Transfer(std::io::Error::other("no device")))
        }
    }

    #[test]
    fn failed_bring_up_keeps_the_bus_and_reports_an_error() {
        let mut device = KncDevice::new(
            "dead0",
            Box::new(DeadBus),
            cores::CoreMapBuilder::new().build(),
            Arc::new(EpochClock::new(1)),
            Duration::from_millis(1),
        );
        assert!(device.start().is_err());
        assert!(device.bus.is_some());
        assert!(device.start().is_err(), "a second attempt reuses the bus");
    }
}
