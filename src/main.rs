mod bus;
mod codec;
mod config;
mod device;
mod discovery;
mod i2c;
mod miner;
mod thermal;
mod work;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{after, unbounded, Receiver};
use knc_wire_spec::{CORES_PER_BOARD, CORE_STATUS_OK};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use bus::shared::BusController;
use bus::sim::{SimConfig, SimulatedBus};
use bus::spidev::{SpiSettings, SpidevBus};
use config::{BusKind, Config, SimSettings};
use device::cores::CoreMapBuilder;
use device::{DeviceEvent, KncDevice, WorkDevice};
use i2c::I2cDev;
use miner::feeder::Feeder;
use miner::ui;
use work::EpochClock;

const MIN_EVENT_WAIT: Duration = Duration::from_millis(1);
const MAX_EVENT_WAIT: Duration = Duration::from_millis(200);

struct Stats {
    started_at: Instant,
    hashes: AtomicU64,
    nonces: AtomicU64,
    completed: AtomicU64,
    hardware_errors: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            hashes: AtomicU64::new(0),
            nonces: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            hardware_errors: AtomicU64::new(0),
        }
    }

    fn print(&self) {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(0.001);
        let hashes = self.hashes.load(Ordering::Relaxed);
        let hps = hashes as f64 / elapsed;

        info!(
            "{:.1}s elapsed | {} | nonces={} completed={} hw_errors={}",
            elapsed,
            format_hashrate(hps),
            self.nonces.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.hardware_errors.load(Ordering::Relaxed),
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceReport {
    name: String,
    cores: usize,
    enabled_cores: usize,
    queue_capacity: usize,
    enqueued: u64,
    rejected: u64,
    pruned: u64,
    flushed: u64,
    dropped_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunReport {
    bus: String,
    elapsed_secs: f64,
    epochs: u64,
    work_generated: u64,
    hashes: u64,
    nonces: u64,
    completed: u64,
    hardware_errors: u64,
    avg_hps: f64,
    median_hps: f64,
    min_hps: f64,
    max_hps: f64,
    samples_hps: Vec<f64>,
    temperatures: Vec<(u8, f32)>,
    devices: Vec<DeviceReport>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse()?;
    ui::init_logging(cfg.log_level)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let clock = Arc::new(EpochClock::new(1));
    let instances = build_devices(&cfg, &clock)?;
    let (mut devices, events) = activate_devices(instances)?;

    ui::startup_banner(
        "knc-miner",
        "KnC ASIC work dispatch",
        &[
            ("bus", bus_label(&cfg)),
            ("devices", device_names(&devices)),
            ("cores", total_cores(&devices).to_string()),
            ("poll", format!("{}us", cfg.poll_interval.as_micros())),
            ("epoch", format!("{}s", cfg.epoch_interval.as_secs())),
            (
                "refresh",
                if cfg.soft_refresh { "soft" } else { "hard" }.to_string(),
            ),
        ],
    );

    let result = run_dispatch_loop(&cfg, &shutdown, &clock, &devices, &events);
    for device in &mut devices {
        device.stop();
    }
    let (stats, feeder, samples) = result?;

    drain_device_events(&events, &stats)?;
    stats.print();

    let report = build_report(&cfg, &stats, &feeder, samples, &devices);
    info!(
        "summary | avg={} | median={} | min={} | max={}",
        format_hashrate(report.avg_hps),
        format_hashrate(report.median_hps),
        format_hashrate(report.min_hps),
        format_hashrate(report.max_hps),
    );
    if let Some(path) = &cfg.stats_output {
        write_report(path, &report)?;
        info!("wrote report to {}", path.display());
    }

    info!("knc-miner stopped");
    Ok(())
}

fn run_dispatch_loop(
    cfg: &Config,
    shutdown: &AtomicBool,
    clock: &Arc<EpochClock>,
    devices: &[KncDevice],
    events: &Receiver<DeviceEvent>,
) -> Result<(Stats, Feeder, Vec<f64>)> {
    let stats = Stats::new();
    let mut feeder = Feeder::new(Arc::clone(clock), cfg.epoch_interval, cfg.soft_refresh);
    let deadline = cfg.duration.map(|duration| stats.started_at + duration);
    let mut samples = Vec::new();
    let mut last_stats_print = Instant::now();
    let mut last_sample_hashes = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            break;
        }

        feeder.tick(now, devices);
        feeder.top_up(devices);

        if last_stats_print.elapsed() >= cfg.stats_interval {
            let hashes = stats.hashes.load(Ordering::Relaxed);
            let interval = last_stats_print.elapsed().as_secs_f64().max(0.001);
            samples.push(hashes.saturating_sub(last_sample_hashes) as f64 / interval);
            last_sample_hashes = hashes;

            stats.print();
            if cfg.bus == BusKind::Spidev {
                log_temperatures(devices);
            }
            last_stats_print = Instant::now();
        }

        let wait_for = next_event_wait(
            feeder.next_epoch_at(),
            last_stats_print + cfg.stats_interval,
            deadline,
            cfg.poll_interval,
        );
        crossbeam_channel::select! {
            recv(events) -> event => {
                let event = event.map_err(|_| anyhow!("device event channel closed"))?;
                handle_device_event(event, &stats)?;
            }
            recv(after(wait_for)) -> _ => {}
        }
    }

    Ok((stats, feeder, samples))
}

fn build_devices(cfg: &Config, clock: &Arc<EpochClock>) -> Result<Vec<KncDevice>> {
    match cfg.bus {
        BusKind::Spidev => {
            let mut control = I2cDev::open(&cfg.i2c)
                .with_context(|| format!("failed to open control bus {}", cfg.i2c.display()))?;
            let cores = discovery::discover(
                &mut control,
                cfg.slaves.iter().copied(),
                CoreMapBuilder::new(),
            )
            .with_context(|| format!("board discovery on {} failed", control.path().display()))?;

            let settings = SpiSettings {
                speed_hz: cfg.spi_speed,
                ..SpiSettings::default()
            };
            let spi = SpidevBus::open(&cfg.spidev, settings)
                .with_context(|| format!("failed to open {}", cfg.spidev.display()))?;
            Ok(vec![KncDevice::new(
                "knc0",
                Box::new(spi),
                cores,
                clock.clone(),
                cfg.poll_interval,
            )])
        }
        BusKind::Sim => build_sim_devices(&cfg.sim, clock, cfg.poll_interval),
    }
}

fn build_sim_devices(
    sim: &SimSettings,
    clock: &Arc<EpochClock>,
    poll_interval: Duration,
) -> Result<Vec<KncDevice>> {
    let boards: Vec<(u8, u32)> = (0..sim.boards)
        .map(|asic| (asic, CORES_PER_BOARD as u32))
        .collect();
    let controller = BusController::new("simbus");

    let mut devices = Vec::with_capacity(usize::from(sim.devices));
    for idx in 0..sim.devices {
        let mut builder = CoreMapBuilder::new();
        for (asic, _) in &boards {
            builder.push_board(*asic, &[CORE_STATUS_OK; CORES_PER_BOARD])?;
        }
        let bus = SimulatedBus::new(SimConfig {
            boards: boards.clone(),
            queue_depth: sim.queue_depth,
            completions_per_poll: sim.completions_per_poll,
            ..SimConfig::default()
        });
        devices.push(KncDevice::new(
            format!("sim{idx}"),
            Box::new(controller.attach(bus)),
            builder.build(),
            clock.clone(),
            poll_interval,
        ));
    }
    Ok(devices)
}

fn activate_devices(
    mut devices: Vec<KncDevice>,
) -> Result<(Vec<KncDevice>, Receiver<DeviceEvent>)> {
    let mut active = Vec::new();
    let (event_tx, event_rx) = unbounded::<DeviceEvent>();

    for mut device in devices.drain(..) {
        if device.core_map().is_empty() {
            warn!("skipping {}: no cores registered", device.name());
            continue;
        }
        device.set_event_sink(event_tx.clone());
        match device.start() {
            Ok(()) => active.push(device),
            Err(err) => error!("{} unavailable: {err:#}", device.name()),
        }
    }

    if active.is_empty() {
        bail!("no device could be started");
    }
    Ok((active, event_rx))
}

fn handle_device_event(event: DeviceEvent, stats: &Stats) -> Result<()> {
    match event {
        DeviceEvent::Nonce { core, work, nonce } => {
            stats.nonces.fetch_add(1, Ordering::Relaxed);
            debug!(
                "{core}: nonce {nonce:08x} for epoch {}",
                work.freshness.epoch
            );
        }
        DeviceEvent::Completed { hashes, .. } => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            stats.hashes.fetch_add(hashes, Ordering::Relaxed);
        }
        DeviceEvent::HardwareError { core, nonce } => {
            stats.hardware_errors.fetch_add(1, Ordering::Relaxed);
            let core = core.map_or_else(|| "?".to_string(), |core| core.to_string());
            match nonce {
                Some(nonce) => debug!("{core}: hardware error, nonce {nonce:08x}"),
                None => debug!("{core}: hardware error"),
            }
        }
        DeviceEvent::Error { device, message } => {
            bail!("device '{device}' reported error: {message}");
        }
    }
    Ok(())
}

fn drain_device_events(events: &Receiver<DeviceEvent>, stats: &Stats) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        handle_device_event(event, stats)?;
    }
    Ok(())
}

fn next_event_wait(
    next_epoch_at: Instant,
    next_stats_at: Instant,
    deadline: Option<Instant>,
    poll_interval: Duration,
) -> Duration {
    let now = Instant::now();
    let mut until = next_epoch_at.min(next_stats_at);
    if let Some(deadline) = deadline {
        until = until.min(deadline);
    }
    until
        .saturating_duration_since(now)
        .min(poll_interval.min(MAX_EVENT_WAIT))
        .max(MIN_EVENT_WAIT)
}

fn log_temperatures(devices: &[KncDevice]) {
    for device in devices {
        for (asic, celsius) in thermal::read_temperatures(device.core_map().asics()) {
            info!("{}: asic {asic} at {celsius:.1}C", device.name());
        }
    }
}

fn build_report(
    cfg: &Config,
    stats: &Stats,
    feeder: &Feeder,
    samples: Vec<f64>,
    devices: &[KncDevice],
) -> RunReport {
    let mut sorted = samples.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let avg_hps = if sorted.is_empty() {
        0.0
    } else {
        sorted.iter().sum::<f64>() / sorted.len() as f64
    };

    let temperatures = match cfg.bus {
        BusKind::Spidev => devices
            .iter()
            .flat_map(|device| thermal::read_temperatures(device.core_map().asics()))
            .collect(),
        BusKind::Sim => Vec::new(),
    };

    RunReport {
        bus: bus_label(cfg),
        elapsed_secs: stats.started_at.elapsed().as_secs_f64(),
        epochs: feeder.epoch(),
        work_generated: feeder.generated(),
        hashes: stats.hashes.load(Ordering::Relaxed),
        nonces: stats.nonces.load(Ordering::Relaxed),
        completed: stats.completed.load(Ordering::Relaxed),
        hardware_errors: stats.hardware_errors.load(Ordering::Relaxed),
        avg_hps,
        median_hps: median(&sorted),
        min_hps: *sorted.first().unwrap_or(&0.0),
        max_hps: *sorted.last().unwrap_or(&0.0),
        samples_hps: samples,
        temperatures,
        devices: devices.iter().map(device_report).collect(),
    }
}

fn device_report(device: &KncDevice) -> DeviceReport {
    let queue = device.queue_stats();
    DeviceReport {
        name: device.name().to_string(),
        cores: device.cores(),
        enabled_cores: device.core_map().enabled(),
        queue_capacity: device.queue_capacity(),
        enqueued: queue.enqueued,
        rejected: queue.rejected,
        pruned: queue.pruned,
        flushed: queue.flushed,
        dropped_events: device.dropped_events(),
    }
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write run report {}", path.display()))
}

fn bus_label(cfg: &Config) -> String {
    match cfg.bus {
        BusKind::Spidev => format!("spidev {}", cfg.spidev.display()),
        BusKind::Sim => format!(
            "sim ({} devices x {} boards)",
            cfg.sim.devices, cfg.sim.boards
        ),
    }
}

fn device_names(devices: &[KncDevice]) -> String {
    devices
        .iter()
        .map(|device| device.name().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn total_cores(devices: &[KncDevice]) -> usize {
    devices.iter().map(|device| device.cores()).sum()
}

fn format_hashrate(hps: f64) -> String {
    if hps >= 1_000_000_000_000.0 {
        return format!("{:.3} TH/s", hps / 1_000_000_000_000.0);
    }
    if hps >= 1_000_000_000.0 {
        return format!("{:.3} GH/s", hps / 1_000_000_000.0);
    }
    if hps >= 1_000_000.0 {
        return format!("{:.3} MH/s", hps / 1_000_000.0);
    }
    if hps >= 1_000.0 {
        return format!("{:.3} KH/s", hps / 1_000.0);
    }
    format!("{hps:.3} H/s")
}

fn median(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len().is_multiple_of(2) {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
