use std::sync::{Arc, Mutex};

use super::{BusError, BusTransport};

/// One bus controller with several chip selects. Transfers through any
/// attached device hold the controller for their whole duration.
#[derive(Clone)]
pub struct BusController {
    name: String,
    lock: Arc<Mutex<()>>,
}

impl BusController {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn attach<T: BusTransport>(&self, bus: T) -> SharedBus<T> {
        SharedBus {
            name: format!("{}/{}", self.name, bus.name()),
            controller: self.clone(),
            bus,
        }
    }
}

pub struct SharedBus<T> {
    name: String,
    controller: BusController,
    bus: T,
}

impl<T: BusTransport> BusTransport for SharedBus<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn transact(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        let _held = self
            .controller
            .lock
            .lock()
            .map_err(|_| BusError::Poisoned)?;
        self.bus.transact(tx, rx)
    }
}
