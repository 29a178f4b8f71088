use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;

const I2C_SLAVE: u32 = 0x0703;
const I2C_SMBUS: u32 = 0x0720;

const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WORD_DATA: u32 = 3;
const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;
const I2C_SMBUS_BLOCK_MAX: usize = 32;

#[derive(Debug, Error)]
pub enum ControlBusError {
    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to select slave {slave:#04x}")]
    SelectSlave {
        slave: u16,
        #[source]
        source: io::Error,
    },
    #[error("read of register {register:#04x} failed")]
    Read {
        register: u8,
        #[source]
        source: io::Error,
    },
    #[error("block read of {requested} bytes returned {returned}")]
    ShortBlock { requested: usize, returned: usize },
}

pub trait ControlBus {
    fn select_slave(&mut self, slave: u16) -> Result<(), ControlBusError>;

    fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<(), ControlBusError>;

    fn read_word(&mut self, register: u8) -> Result<u16, ControlBusError>;
}

/// `union i2c_smbus_data` from `linux/i2c.h`.
#[repr(C)]
union SmbusData {
    word: u16,
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

/// `struct i2c_smbus_ioctl_data` from `linux/i2c-dev.h`.
#[repr(C)]
struct SmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut SmbusData,
}

pub struct I2cDev {
    path: PathBuf,
    file: File,
}

impl I2cDev {
    pub fn open(path: &Path) -> Result<Self, ControlBusError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ControlBusError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn smbus_read(&mut self, register: u8, size: u32, data: &mut SmbusData) -> io::Result<()> {
        let mut args = SmbusIoctlData {
            read_write: I2C_SMBUS_READ,
            command: register,
            size,
            data,
        };
        // SAFETY: `args` and the buffer it points at live across the call.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SMBUS as _,
                &mut args as *mut SmbusIoctlData,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl ControlBus for I2cDev {
    fn select_slave(&mut self, slave: u16) -> Result<(), ControlBusError> {
        // SAFETY: I2C_SLAVE takes the address by value.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(slave),
            )
        };
        if rc < 0 {
            return Err(ControlBusError::SelectSlave {
                slave,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<(), ControlBusError> {
        let requested = buf.len().min(I2C_SMBUS_BLOCK_MAX);
        let mut block = [0; I2C_SMBUS_BLOCK_MAX + 2];
        block[0] = requested as u8;
        let mut data = SmbusData { block };
        self.smbus_read(register, I2C_SMBUS_I2C_BLOCK_DATA, &mut data)
            .map_err(|source| ControlBusError::Read { register, source })?;

        // SAFETY: block reads fill the `block` variant.
        let block = unsafe { data.block };
        let returned = usize::from(block[0]);
        if returned < buf.len() {
            return Err(ControlBusError::ShortBlock {
                requested: buf.len(),
                returned,
            });
        }
        buf.copy_from_slice(&block[1..=buf.len()]);
        Ok(())
    }

    fn read_word(&mut self, register: u8) -> Result<u16, ControlBusError> {
        let mut data = SmbusData { word: 0 };
        self.smbus_read(register, I2C_SMBUS_WORD_DATA, &mut data)
            .map_err(|source| ControlBusError::Read { register, source })?;
        // SAFETY: word reads fill the `word` variant.
        Ok(unsafe { data.word })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smbus_structures_match_kernel_layout() {
        assert_eq!(std::mem::size_of::<SmbusData>(), 34);
        assert_eq!(
            std::mem::size_of::<SmbusIoctlData>(),
            8 + std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn opening_a_missing_adapter_names_the_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("i2c-9");
        let err = I2cDev::open(&path).err().expect("missing adapter must fail");
        assert!(err.to_string().contains("i2c-9"));
    }
}
