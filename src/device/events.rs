use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Sender;

use super::cores::CoreId;
use super::DeviceEvent;
use crate::work::WorkItem;

#[derive(Clone, Default)]
pub struct EventSink {
    slot: Arc<RwLock<Option<Sender<DeviceEvent>>>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn set(&self, sink: Sender<DeviceEvent>) {
        if let Ok(mut slot) = self.slot.write() {
            *slot = Some(sink);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn report_nonce(&self, core: CoreId, work: Arc<WorkItem>, nonce: u32) {
        self.emit(DeviceEvent::Nonce { core, work, nonce });
    }

    pub fn report_completed(&self, core: CoreId, hashes: u64) {
        self.emit(DeviceEvent::Completed { core, hashes });
    }

    pub fn report_hardware_error(&self, core: Option<CoreId>, nonce: Option<u32>) {
        self.emit(DeviceEvent::HardwareError { core, nonce });
    }

    pub fn report_error(&self, device: &str, message: String) {
        self.emit(DeviceEvent::Error {
            device: device.to_string(),
            message,
        });
    }

    fn emit(&self, event: DeviceEvent) {
        let tx = match self.slot.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if tx.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;

    #[test]
    fn events_without_a_sink_are_counted_as_dropped() {
        let sink = EventSink::default();
        sink.report_completed(CoreId(0), 1);
        assert_eq!(sink.dropped(), 1);

        let (tx, rx) = unbounded();
        sink.set(tx);
        sink.report_hardware_error(Some(CoreId(3)), Some(7));
        match rx.try_recv() {
            Ok(DeviceEvent::HardwareError { core, nonce }) => {
                assert_eq!(core, Some(CoreId(3)));
                assert_eq!(nonce, Some(7));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(rx);
        sink.report_completed(CoreId(0), 1);
        assert_eq!(sink.dropped(), 2);
    }
}
