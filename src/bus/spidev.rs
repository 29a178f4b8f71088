use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use knc_wire_spec::{SPI_BITS_PER_WORD, SPI_DELAY_USECS, SPI_SPEED_HZ};

use super::{BusError, BusTransport};

pub const SPI_CPHA: u8 = 0x01;
pub const SPI_CPOL: u8 = 0x02;
pub const SPI_CS_HIGH: u8 = 0x04;

pub const KNC_SPI_MODE: u8 = SPI_CPHA | SPI_CPOL | SPI_CS_HIGH;

const SPI_IOC_MAGIC: u32 = b'k' as u32;
const IOC_WRITE: u32 = 1;

const fn spi_iow(nr: u32, size: usize) -> u32 {
    (IOC_WRITE << 30) | ((size as u32) << 16) | (SPI_IOC_MAGIC << 8) | nr
}

const SPI_IOC_WR_MODE: u32 = spi_iow(1, 1);
const SPI_IOC_WR_LSB_FIRST: u32 = spi_iow(2, 1);
const SPI_IOC_WR_BITS_PER_WORD: u32 = spi_iow(3, 1);
const SPI_IOC_WR_MAX_SPEED_HZ: u32 = spi_iow(4, 4);
const SPI_IOC_MESSAGE_1: u32 = spi_iow(0, std::mem::size_of::<SpiIocTransfer>());

/// Mirror of `struct spi_ioc_transfer` from `linux/spi/spidev.h`.
#[repr(C)]
#[derive(Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SpiSettings {
    pub mode: u8,
    pub speed_hz: u32,
    pub delay_usecs: u16,
    pub bits_per_word: u8,
}

impl Default for SpiSettings {
    fn default() -> Self {
        Self {
            mode: KNC_SPI_MODE,
            speed_hz: SPI_SPEED_HZ,
            delay_usecs: SPI_DELAY_USECS,
            bits_per_word: SPI_BITS_PER_WORD,
        }
    }
}

pub struct SpidevBus {
    name: String,
    file: File,
    settings: SpiSettings,
}

impl SpidevBus {
    pub fn open(path: &Path, settings: SpiSettings) -> Result<Self, BusError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| BusError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let fd = file.as_raw_fd();
        let lsb_first = 0u8;
        configure(fd, path, "mode", SPI_IOC_WR_MODE, &settings.mode)?;
        configure(fd, path, "bit order", SPI_IOC_WR_LSB_FIRST, &lsb_first)?;
        configure(
            fd,
            path,
            "bits per word",
            SPI_IOC_WR_BITS_PER_WORD,
            &settings.bits_per_word,
        )?;
        configure(
            fd,
            path,
            "max speed",
            SPI_IOC_WR_MAX_SPEED_HZ,
            &settings.speed_hz,
        )?;

        Ok(Self {
            name: path.display().to_string(),
            file,
            settings,
        })
    }
}

fn configure<T>(
    fd: libc::c_int,
    path: &Path,
    what: &'static str,
    request: u32,
    value: &T,
) -> Result<(), BusError> {
    // SAFETY: `value` outlives the call and matches the size encoded in `request`.
    let rc = unsafe { libc::ioctl(fd, request as _, value as *const T) };
    if rc < 0 {
        return Err(BusError::Configure {
            path: PathBuf::from(path),
            what,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

impl BusTransport for SpidevBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn transact(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        if tx.len() != rx.len() {
            return Err(BusError::LengthMismatch {
                tx: tx.len(),
                rx: rx.len(),
            });
        }

        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.settings.speed_hz,
            delay_usecs: self.settings.delay_usecs,
            bits_per_word: self.settings.bits_per_word,
            ..SpiIocTransfer::default()
        };

        // SAFETY: both buffers are live for the duration of the ioctl and
        // have the length recorded in `transfer`.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                SPI_IOC_MESSAGE_1 as _,
                &transfer as *const SpiIocTransfer,
            )
        };
        if rc <= 0 {
            return Err(BusError::Transfer(io::Error::last_os_error()));
        }
        Ok(())
    }
}
