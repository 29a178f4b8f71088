use std::collections::VecDeque;
use std::io;

use knc_wire_spec::{
    REPLY_HEADER_LEN, REPLY_RECORD_LEN, REQUEST_FRAME_LEN, REQ_FLUSH_QUEUE, REQ_SUBMIT_WORK,
};

use super::{BusError, BusTransport};
use crate::codec::{
    decode_submission, encode_header, encode_record, CoreAddress, ReplyHeader, ReplyKind,
    ReplyRecord,
};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub boards: Vec<(u8, u32)>,
    pub queue_depth: u16,
    pub completions_per_poll: usize,
    pub nonce_every: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            boards: vec![(0, 192)],
            queue_depth: 16,
            completions_per_poll: 1,
            nonce_every: 4,
        }
    }
}

pub struct SimulatedBus {
    config: SimConfig,
    pending: VecDeque<u16>,
    injected: VecDeque<ReplyRecord>,
    fail_next: u32,
}

impl SimulatedBus {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            injected: VecDeque::new(),
            fail_next: 0,
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> impl Iterator<Item = u16> + '_ {
        self.pending.iter().copied()
    }

    #[cfg(test)]
    pub fn inject_reply(&mut self, record: ReplyRecord) {
        self.injected.push_back(record);
    }

    #[cfg(test)]
    pub fn fail_next(&mut self, count: u32) {
        self.fail_next = count;
    }

    fn address_for(&self, id: u16) -> CoreAddress {
        let total: u32 = self.config.boards.iter().map(|(_, cores)| *cores).sum();
        let mut slot = u32::from(id) % total.max(1);
        for (asic, cores) in &self.config.boards {
            if slot < *cores {
                return CoreAddress {
                    asic: *asic,
                    core: slot,
                };
            }
            slot -= cores;
        }
        CoreAddress { asic: 0, core: 0 }
    }

    fn completed_replies(&mut self) -> Vec<ReplyRecord> {
        let mut replies: Vec<ReplyRecord> = self.injected.drain(..).collect();
        let nonce_every = self.config.nonce_every.max(1);
        for _ in 0..self.config.completions_per_poll {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            let address = self.address_for(id);
            if id % nonce_every == 0 {
                replies.push(ReplyRecord {
                    kind: ReplyKind::NonceFound,
                    address,
                    work_id: id,
                    nonce: u32::from(id).wrapping_mul(0x9e37_79b9),
                });
            }
            replies.push(ReplyRecord {
                kind: ReplyKind::WorkDone,
                address,
                work_id: id,
                nonce: 0,
            });
        }
        replies
    }
}

impl BusTransport for SimulatedBus {
    fn name(&self) -> &str {
        "sim"
    }

    fn transact(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        if tx.len() != rx.len() {
            return Err(BusError::LengthMismatch {
                tx: tx.len(),
                rx: rx.len(),
            });
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(BusError::Transfer(io::Error::other("simulated transfer fault")));
        }

        let replies = self.completed_replies();

        // Submissions are only taken while there is headroom; the header
        // reports the headroom seen before a batch that carried any.
        let free = usize::from(self.config.queue_depth).saturating_sub(self.pending.len());
        let mut offered = 0usize;
        let mut taken = 0usize;
        let mut refused = false;
        for frame in tx.chunks(REQUEST_FRAME_LEN) {
            match frame[0] >> 4 {
                REQ_FLUSH_QUEUE => self.pending.clear(),
                REQ_SUBMIT_WORK => {
                    let Some(submission) = decode_submission(frame) else {
                        break;
                    };
                    offered += 1;
                    if taken < free {
                        self.pending.push_back(submission.id);
                        taken += 1;
                    } else {
                        refused = true;
                    }
                }
                _ => break,
            }
        }

        rx.fill(0);
        if rx.len() >= REPLY_HEADER_LEN {
            encode_header(
                ReplyHeader {
                    overflow: refused,
                    accepted: if offered == 0 {
                        0
                    } else {
                        u16::try_from(free).unwrap_or(u16::MAX)
                    },
                },
                rx,
            );
        }
        let slots = rx
            .get_mut(REPLY_HEADER_LEN..)
            .unwrap_or_default()
            .chunks_exact_mut(REPLY_RECORD_LEN);
        for (slot, reply) in slots.zip(replies.iter()) {
            encode_record(reply, slot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use knc_wire_spec::TRANSACTION_LEN;

    use super::*;
    use crate::codec::{decode_header, encode_flush, encode_submission, reply_records};
    use crate::work::test_work;

    fn transaction(frames: &[[u8; REQUEST_FRAME_LEN]]) -> Vec<u8> {
        let mut tx = vec![knc_wire_spec::NOP_BYTE; TRANSACTION_LEN];
        for (idx, frame) in frames.iter().enumerate() {
            tx[idx * REQUEST_FRAME_LEN..(idx + 1) * REQUEST_FRAME_LEN].copy_from_slice(frame);
        }
        tx
    }

    #[test]
    fn accepts_up_to_queue_depth_and_flags_overflow() {
        let mut bus = SimulatedBus::new(SimConfig {
            queue_depth: 2,
            completions_per_poll: 0,
            ..SimConfig::default()
        });
        let work = test_work(1, 1);
        let tx = transaction(&[
            encode_submission(0, &work),
            encode_submission(1, &work),
            encode_submission(2, &work),
        ]);
        let mut rx = vec![0u8; TRANSACTION_LEN];
        bus.transact(&tx, &mut rx).expect("sim transfer should succeed");

        let header = decode_header(&rx);
        assert_eq!(header.accepted, 2);
        assert!(header.overflow);
        assert_eq!(bus.pending().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn completes_oldest_work_and_honours_flush() {
        let mut bus = SimulatedBus::new(SimConfig {
            nonce_every: 1,
            ..SimConfig::default()
        });
        let work = test_work(1, 1);
        let mut rx = vec![0u8; TRANSACTION_LEN];
        let tx = transaction(&[encode_submission(5, &work), encode_submission(6, &work)]);
        bus.transact(&tx, &mut rx).expect("sim transfer should succeed");
        assert_eq!(reply_records(&rx).count(), 0);

        let tx = transaction(&[encode_flush()]);
        bus.transact(&tx, &mut rx).expect("sim transfer should succeed");
        let replies: Vec<_> = reply_records(&rx).collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind, ReplyKind::NonceFound);
        assert_eq!(replies[1].kind, ReplyKind::WorkDone);
        assert_eq!(replies[1].work_id, 5);
        assert_eq!(bus.pending().count(), 0, "flush must drop the rest");
    }

    #[test]
    fn scheduled_faults_fail_without_touching_state() {
        let mut bus = SimulatedBus::new(SimConfig::default());
        bus.fail_next(1);
        let tx = transaction(&[encode_submission(3, &test_work(1, 1))]);
        let mut rx = vec![0u8; TRANSACTION_LEN];
        assert!(bus.transact(&tx, &mut rx).is_err());
        assert_eq!(bus.pending().count(), 0);
        assert!(bus.transact(&tx, &mut rx).is_ok());
        assert_eq!(bus.pending().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn idle_batches_report_nothing_accepted() {
        let mut bus = SimulatedBus::new(SimConfig::default());
        let tx = vec![knc_wire_spec::NOP_BYTE; TRANSACTION_LEN];
        let mut rx = vec![0u8; TRANSACTION_LEN];
        bus.transact(&tx, &mut rx).expect("sim transfer should succeed");
        assert_eq!(decode_header(&rx).accepted, 0);
    }
}
