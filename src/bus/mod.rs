use std::io;
use std::path::PathBuf;

use knc_wire_spec::NOP_BYTE;
use thiserror::Error;

pub mod shared;
pub mod sim;
pub mod spidev;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to set {what} on {}", path.display())]
    Configure {
        path: PathBuf,
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("transfer failed")]
    Transfer(#[source] io::Error),
    #[error("buffer length mismatch (tx={tx}, rx={rx})")]
    LengthMismatch { tx: usize, rx: usize },
    #[error("bus lock poisoned")]
    Poisoned,
}

pub trait BusTransport: Send {
    fn name(&self) -> &str;

    fn transact(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn transact(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        (**self).transact(tx, rx)
    }
}

pub struct TransferBuffers {
    tx: Vec<u8>,
    rx: Vec<u8>,
    filled: usize,
}

impl TransferBuffers {
    pub fn new(len: usize) -> Self {
        Self {
            tx: vec![NOP_BYTE; len],
            rx: vec![0; len],
            filled: 0,
        }
    }

    #[cfg(test)]
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn remaining(&self) -> usize {
        self.tx.len() - self.filled
    }

    pub fn clear(&mut self) {
        self.filled = 0;
        self.tx.fill(NOP_BYTE);
        self.rx.fill(0);
    }

    pub fn emit(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.tx[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
        true
    }

    pub fn pad_with_nops(&mut self) {
        self.tx[self.filled..].fill(NOP_BYTE);
        self.filled = self.tx.len();
    }

    pub fn transact(&mut self, bus: &mut dyn BusTransport) -> Result<(), BusError> {
        self.pad_with_nops();
        bus.transact(&self.tx, &mut self.rx)
    }

    #[cfg(test)]
    pub fn tx(&self) -> &[u8] {
        &self.tx
    }

    pub fn rx(&self) -> &[u8] {
        &self.rx
    }
}
