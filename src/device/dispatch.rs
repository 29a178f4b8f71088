use knc_wire_spec::HASHES_PER_WORK;
use log::{debug, log_enabled, warn, Level};

use super::cores::CoreMap;
use super::events::EventSink;
use super::table::DeviceTable;
use crate::codec::{decode_record, record_slots, reply_tag, ReplyKind};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DispatchSummary {
    pub nonces: u32,
    pub completed: u32,
    pub unknown: u32,
    pub unresolved: u32,
}

pub fn dispatch_replies(
    device: &str,
    rx: &[u8],
    table: &mut DeviceTable,
    cores: &CoreMap,
    events: &EventSink,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();

    for slot in record_slots(rx) {
        if reply_tag(slot) != 0 && log_enabled!(Level::Debug) {
            debug!("{device}: RECV: {}", hex(slot));
        }
        let Some(record) = decode_record(slot) else {
            continue;
        };

        let core = cores.resolve(record.address);
        if core.is_none() {
            summary.unresolved += 1;
            warn!(
                "{device}: {} reply from unknown core asic={} core={}",
                record.kind.label(),
                record.address.asic,
                record.address.core
            );
        }

        if table.get(record.work_id).is_none() {
            summary.unknown += 1;
            let origin = core.map_or_else(|| "?".to_string(), |core| cores.label(core));
            warn!(
                "{device}: {origin}: got {} message about unknown work {:#06x}",
                record.kind.label(),
                record.work_id
            );
            let nonce = (record.kind == ReplyKind::NonceFound).then_some(record.nonce);
            events.report_hardware_error(core, nonce);
            continue;
        }

        match record.kind {
            ReplyKind::NonceFound => match (core, table.get(record.work_id)) {
                (Some(core), Some(work)) => {
                    summary.nonces += 1;
                    events.report_nonce(core, work.clone(), record.nonce);
                }
                _ => events.report_hardware_error(None, Some(record.nonce)),
            },
            ReplyKind::WorkDone => {
                table.remove(record.work_id);
                match core {
                    Some(core) => {
                        summary.completed += 1;
                        events.report_completed(core, HASHES_PER_WORK);
                    }
                    None => events.report_hardware_error(None, None),
                }
            }
        }
    }

    summary
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::{unbounded, Receiver};
    use knc_wire_spec::{REPLY_HEADER_LEN, REPLY_RECORD_LEN, TRANSACTION_LEN};

    use super::*;
    use crate::codec::{encode_record, CoreAddress, ReplyRecord};
    use crate::device::cores::{CoreId, CoreMapBuilder};
    use crate::device::DeviceEvent;
    use crate::work::test_work;

    fn cores() -> CoreMap {
        let mut builder = CoreMapBuilder::new();
        builder.push_board(0, &[3; 4]).expect("board 0");
        builder.push_board(1, &[3; 4]).expect("board 1");
        builder.build()
    }

    fn sink() -> (EventSink, Receiver<DeviceEvent>) {
        let (tx, rx) = unbounded();
        let sink = EventSink::default();
        sink.set(tx);
        (sink, rx)
    }

    fn rx_with(records: &[ReplyRecord]) -> Vec<u8> {
        let mut rx = vec![0u8; TRANSACTION_LEN];
        for (idx, record) in records.iter().enumerate() {
            let offset = REPLY_HEADER_LEN + idx * REPLY_RECORD_LEN;
            encode_record(record, &mut rx[offset..]);
        }
        rx
    }

    #[test]
    fn nonce_keeps_work_tracked_and_done_retires_it() {
        let mut table = DeviceTable::new();
        let work = Arc::new(test_work(1, 1));
        let (id, _) = table.insert_next(Arc::clone(&work));
        let address = CoreAddress { asic: 1, core: 2 };
        let rx = rx_with(&[
            ReplyRecord {
                kind: ReplyKind::NonceFound,
                address,
                work_id: id,
                nonce: 0x0102_0304,
            },
            ReplyRecord {
                kind: ReplyKind::NonceFound,
                address,
                work_id: id,
                nonce: 0x0506_0708,
            },
            ReplyRecord {
                kind: ReplyKind::WorkDone,
                address,
                work_id: id,
                nonce: 0,
            },
        ]);
        let (events, event_rx) = sink();

        let summary = dispatch_replies("knc", &rx, &mut table, &cores(), &events);
        assert_eq!(summary.nonces, 2);
        assert_eq!(summary.completed, 1);
        assert!(table.is_empty());

        let received: Vec<_> = event_rx.try_iter().collect();
        assert_eq!(received.len(), 3);
        match &received[0] {
            DeviceEvent::Nonce {
                core,
                work: reported,
                nonce,
            } => {
                assert_eq!(*core, CoreId(6));
                assert!(Arc::ptr_eq(reported, &work));
                assert_eq!(*nonce, 0x0102_0304);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &received[2] {
            DeviceEvent::Completed { core, hashes } => {
                assert_eq!(*core, CoreId(6));
                assert_eq!(*hashes, HASHES_PER_WORK);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_id_nonce_reports_hardware_error_with_nonce() {
        let mut table = DeviceTable::new();
        table.insert_next(Arc::new(test_work(1, 1)));
        let mut rx = vec![0u8; TRANSACTION_LEN];
        // Captured wire bytes: nonce found, asic 0, id 0x0042, core 3.
        rx[REPLY_HEADER_LEN..REPLY_HEADER_LEN + REPLY_RECORD_LEN].copy_from_slice(&[
            0x40, 0x00, 0x00, 0x42, 0xaa, 0xbb, 0xcc, 0xdd, 0x00, 0x00, 0x00, 0x03,
        ]);
        let (events, event_rx) = sink();

        let summary = dispatch_replies("knc", &rx, &mut table, &cores(), &events);
        assert_eq!(summary.unknown, 1);
        assert_eq!(table.len(), 1, "table must be untouched");

        match event_rx.try_recv() {
            Ok(DeviceEvent::HardwareError { core, nonce }) => {
                assert_eq!(core, Some(CoreId(3)));
                assert_eq!(nonce, Some(u32::from_le(0xaabb_ccdd)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_id_work_done_reports_hardware_error_without_nonce() {
        let mut table = DeviceTable::new();
        let rx = rx_with(&[ReplyRecord {
            kind: ReplyKind::WorkDone,
            address: CoreAddress { asic: 0, core: 0 },
            work_id: 5,
            nonce: 0,
        }]);
        let (events, event_rx) = sink();
        dispatch_replies("knc", &rx, &mut table, &cores(), &events);
        match event_rx.try_recv() {
            Ok(DeviceEvent::HardwareError { core, nonce }) => {
                assert_eq!(core, Some(CoreId(0)));
                assert_eq!(nonce, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn bad_records_do_not_stop_later_ones() {
        let mut table = DeviceTable::new();
        let work = Arc::new(test_work(1, 1));
        let (id, _) = table.insert_next(Arc::clone(&work));
        let good = CoreAddress { asic: 0, core: 2 };
        let rx = rx_with(&[
            ReplyRecord {
                kind: ReplyKind::NonceFound,
                address: good,
                work_id: id + 40,
                nonce: 1,
            },
            ReplyRecord {
                kind: ReplyKind::NonceFound,
                address: CoreAddress { asic: 1, core: 9 },
                work_id: id,
                nonce: 2,
            },
            ReplyRecord {
                kind: ReplyKind::NonceFound,
                address: good,
                work_id: id,
                nonce: 3,
            },
            ReplyRecord {
                kind: ReplyKind::WorkDone,
                address: good,
                work_id: id,
                nonce: 0,
            },
        ]);
        let (events, event_rx) = sink();

        let summary = dispatch_replies("knc", &rx, &mut table, &cores(), &events);
        assert_eq!(
            summary,
            DispatchSummary {
                nonces: 1,
                completed: 1,
                unknown: 1,
                unresolved: 1,
            }
        );
        assert!(table.is_empty());

        let received: Vec<_> = event_rx.try_iter().collect();
        assert_eq!(received.len(), 4);
        assert!(matches!(
            received[0],
            DeviceEvent::HardwareError {
                core: Some(CoreId(2)),
                nonce: Some(1)
            }
        ));
        assert!(matches!(
            received[1],
            DeviceEvent::HardwareError {
                core: None,
                nonce: Some(2)
            }
        ));
        assert!(matches!(
            received[2],
            DeviceEvent::Nonce {
                core: CoreId(2),
                nonce: 3,
                ..
            }
        ));
        assert!(matches!(
            received[3],
            DeviceEvent::Completed {
                core: CoreId(2),
                ..
            }
        ));
    }

    #[test]
    fn filler_records_produce_no_events() {
        let mut table = DeviceTable::new();
        let (id, _) = table.insert_next(Arc::new(test_work(1, 1)));
        let mut rx = vec![0u8; TRANSACTION_LEN];
        for (idx, tag) in [0x00u8, 0xc0, 0xc8].iter().enumerate() {
            let offset = REPLY_HEADER_LEN + idx * REPLY_RECORD_LEN;
            rx[offset] = *tag;
            rx[offset + 3] = id as u8;
        }
        let (events, event_rx) = sink();

        let summary = dispatch_replies("knc", &rx, &mut table, &cores(), &events);
        assert_eq!(summary, DispatchSummary::default());
        assert_eq!(table.len(), 1);
        assert!(event_rx.try_recv().is_err());
    }

    #[test]
    fn unresolved_core_still_retires_known_work() {
        let mut table = DeviceTable::new();
        let (id, _) = table.insert_next(Arc::new(test_work(1, 1)));
        let rx = rx_with(&[ReplyRecord {
            kind: ReplyKind::WorkDone,
            address: CoreAddress { asic: 7, core: 0 },
            work_id: id,
            nonce: 0,
        }]);
        let (events, event_rx) = sink();

        let summary = dispatch_replies("knc", &rx, &mut table, &cores(), &events);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.completed, 0);
        assert!(table.is_empty());
        assert!(matches!(
            event_rx.try_recv(),
            Ok(DeviceEvent::HardwareError {
                core: None,
                nonce: None
            })
        ));
    }
}
