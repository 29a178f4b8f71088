use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use knc_wire_spec::{BOARD_SLAVE_FIRST, BOARD_SLAVE_LAST, POLL_INTERVAL_US, SPI_SPEED_HZ};
use log::LevelFilter;

const MAX_SIM_DEVICES: u8 = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum BusKind {
    /// KnC boards on a Linux spidev node, enumerated over I2C.
    Spidev,
    /// In-process board model.
    Sim,
}

/// Drive KnC ASIC boards over SPI
#[derive(Parser, Debug)]
#[command(name = "knc-miner", version, about)]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = BusKind::Spidev)]
    pub bus: BusKind,

    #[arg(long, default_value = "/dev/spidev1.0")]
    pub spidev: PathBuf,

    /// SPI clock in Hz
    #[arg(long, default_value_t = SPI_SPEED_HZ)]
    pub spi_speed: u32,

    /// I2C adapter the board controllers answer on
    #[arg(long, default_value = "/dev/i2c-2")]
    pub i2c: PathBuf,

    /// Board slave addresses to probe (e.g. 0x20,0x21)
    #[arg(long, value_delimiter = ',', value_parser = parse_slave)]
    pub slaves: Vec<u16>,

    #[arg(long, default_value_t = POLL_INTERVAL_US)]
    pub poll_interval_us: u64,

    #[arg(long, default_value_t = 10)]
    pub stats_secs: u64,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Seconds between synthetic work epochs
    #[arg(long, default_value_t = 30)]
    pub epoch_secs: u64,

    /// Keep work from earlier epochs running on the boards when the epoch
    /// changes
    #[arg(long)]
    pub soft_refresh: bool,

    /// Simulated devices sharing one bus controller
    #[arg(long, default_value_t = 1)]
    pub sim_devices: u8,

    #[arg(long, default_value_t = 1)]
    pub sim_boards: u8,

    #[arg(long, default_value_t = 16)]
    pub sim_queue_depth: u16,

    #[arg(long, default_value_t = 4)]
    pub sim_completions: usize,

    /// Write a JSON run report to this file on exit
    #[arg(long)]
    pub stats_output: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,

    /// Shorthand for --log-level debug
    #[arg(long)]
    pub debug: bool,
}

fn parse_slave(raw: &str) -> Result<u16, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("invalid slave address '{raw}': {err}"))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SimSettings {
    pub devices: u8,
    pub boards: u8,
    pub queue_depth: u16,
    pub completions_per_poll: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusKind,
    pub spidev: PathBuf,
    pub spi_speed: u32,
    pub i2c: PathBuf,
    pub slaves: Vec<u16>,
    pub poll_interval: Duration,
    pub stats_interval: Duration,
    pub duration: Option<Duration>,
    pub epoch_interval: Duration,
    pub soft_refresh: bool,
    pub sim: SimSettings,
    pub stats_output: Option<PathBuf>,
    pub log_level: LevelFilter,
}

impl Config {
    pub fn parse() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.poll_interval_us == 0 {
            bail!("--poll-interval-us must be at least 1");
        }
        if cli.stats_secs == 0 {
            bail!("--stats-secs must be at least 1");
        }
        if cli.epoch_secs == 0 {
            bail!("--epoch-secs must be at least 1");
        }
        if cli.spi_speed == 0 {
            bail!("--spi-speed must be non-zero");
        }

        let slaves = if cli.slaves.is_empty() {
            (BOARD_SLAVE_FIRST..=BOARD_SLAVE_LAST).collect()
        } else {
            cli.slaves
        };
        if let Some(bad) = slaves
            .iter()
            .find(|slave| !(BOARD_SLAVE_FIRST..=BOARD_SLAVE_LAST).contains(*slave))
        {
            bail!(
                "slave {bad:#04x} is outside {BOARD_SLAVE_FIRST:#04x}..={BOARD_SLAVE_LAST:#04x}"
            );
        }

        let max_boards = (BOARD_SLAVE_LAST - BOARD_SLAVE_FIRST + 1) as u8;
        if cli.sim_boards == 0 || cli.sim_boards > max_boards {
            bail!("--sim-boards must be between 1 and {max_boards}");
        }
        if cli.sim_devices == 0 || cli.sim_devices > MAX_SIM_DEVICES {
            bail!("--sim-devices must be between 1 and {MAX_SIM_DEVICES}");
        }
        if cli.sim_queue_depth == 0 {
            bail!("--sim-queue-depth must be at least 1");
        }

        Ok(Self {
            bus: cli.bus,
            spidev: cli.spidev,
            spi_speed: cli.spi_speed,
            i2c: cli.i2c,
            slaves,
            poll_interval: Duration::from_micros(cli.poll_interval_us),
            stats_interval: Duration::from_secs(cli.stats_secs),
            duration: cli.duration_secs.map(Duration::from_secs),
            epoch_interval: Duration::from_secs(cli.epoch_secs),
            soft_refresh: cli.soft_refresh,
            sim: SimSettings {
                devices: cli.sim_devices,
                boards: cli.sim_boards,
                queue_depth: cli.sim_queue_depth,
                completions_per_poll: cli.sim_completions,
            },
            stats_output: cli.stats_output,
            log_level: if cli.debug {
                LevelFilter::Debug
            } else {
                cli.log_level
            },
        })
    }
}
