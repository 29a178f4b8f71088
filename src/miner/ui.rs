use anyhow::{anyhow, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};

const BANNER_WIDTH: usize = 84;
const KEY_WIDTH: usize = 14;
const LOGO: &[&str] = &[
    "  _  __ _   _   ____ ",
    " | |/ /| \\ | | / ___|",
    " | ' / |  \\| || |    ",
    " | . \\ | |\\  || |___ ",
    " |_|\\_\\|_| \\_| \\____|",
];

pub(crate) fn startup_banner(title: &str, subtitle: &str, lines: &[(&str, String)]) {
    let border = "=".repeat(BANNER_WIDTH);
    let divider = "-".repeat(BANNER_WIDTH);
    println!();
    println!("{border}");
    for line in LOGO {
        println!("{:^width$}", line, width = BANNER_WIDTH);
    }
    println!("{divider}");
    println!("{:^width$}", title, width = BANNER_WIDTH);
    println!("{:^width$}", subtitle, width = BANNER_WIDTH);
    println!("{border}");
    for (key, value) in lines {
        println!(
            "  {:<key_width$} {}",
            format!("{key}:"),
            value,
            key_width = KEY_WIDTH
        );
    }
    println!("{border}");
    println!();
}

struct UiLogger;

static LOGGER: UiLogger = UiLogger;

impl Log for UiLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {}",
            prefix(record.level(), &tag(record.target())),
            record.args()
        );
        match record.level() {
            Level::Error | Level::Warn => eprintln!("{line}"),
            _ => println!("{line}"),
        }
    }

    fn flush(&self) {}
}

pub(crate) fn init_logging(level: LevelFilter) -> Result<()> {
    log::set_logger(&LOGGER).map_err(|err| anyhow!("failed to install logger: {err}"))?;
    log::set_max_level(level);
    Ok(())
}

fn tag(target: &str) -> String {
    target
        .rsplit("::")
        .next()
        .unwrap_or(target)
        .to_ascii_uppercase()
}

fn prefix(level: Level, tag: &str) -> String {
    let level = match level {
        Level::Error => "ERR ",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DBG ",
        Level::Trace => "TRC ",
    };
    format!("[{level}][{tag:<8}]")
}
