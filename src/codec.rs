//! Byte layout of the KnC SPI protocol.
//!
//! Outbound, every transaction carries request frames packed from the
//! front of the buffer and no-op filler after them. Inbound, the first
//! record-sized slot is a status header and the remaining slots are reply
//! records interleaved from every core on every board.

use knc_wire_spec::{
    command_byte, DATA_TAIL_LEN, MIDSTATE_LEN, REPLY_HEADER_LEN, REPLY_NONCE_FOUND,
    REPLY_RECORD_LEN, REPLY_WORK_DONE, REQUEST_FRAME_LEN, REQ_FLUSH_QUEUE, REQ_SUBMIT_WORK,
    WORK_ID_MASK,
};

use crate::work::WorkItem;

const MIDSTATE_OFFSET: usize = 4;
const TAIL_OFFSET: usize = MIDSTATE_OFFSET + MIDSTATE_LEN;

pub fn encode_submission(id: u16, work: &WorkItem) -> [u8; REQUEST_FRAME_LEN] {
    let mut frame = [0u8; REQUEST_FRAME_LEN];
    frame[0] = command_byte(REQ_SUBMIT_WORK);
    frame[2..4].copy_from_slice(&(id & WORK_ID_MASK).to_be_bytes());
    for (dst, src) in frame[MIDSTATE_OFFSET..TAIL_OFFSET]
        .iter_mut()
        .zip(work.midstate.iter().rev())
    {
        *dst = *src;
    }
    for (dst, src) in frame[TAIL_OFFSET..TAIL_OFFSET + DATA_TAIL_LEN]
        .iter_mut()
        .zip(work.data_tail().iter().rev())
    {
        *dst = *src;
    }
    frame
}

pub fn encode_flush() -> [u8; REQUEST_FRAME_LEN] {
    let mut frame = [0u8; REQUEST_FRAME_LEN];
    frame[0] = command_byte(REQ_FLUSH_QUEUE);
    frame
}

pub fn bring_up_flush() -> [u8; 1] {
    [command_byte(REQ_FLUSH_QUEUE)]
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubmissionFrame {
    pub id: u16,
    pub midstate: [u8; MIDSTATE_LEN],
    pub data_tail: [u8; DATA_TAIL_LEN],
}

pub fn decode_submission(frame: &[u8]) -> Option<SubmissionFrame> {
    if frame.len() < REQUEST_FRAME_LEN || frame[0] >> 4 != REQ_SUBMIT_WORK {
        return None;
    }
    let mut midstate = [0u8; MIDSTATE_LEN];
    for (dst, src) in midstate
        .iter_mut()
        .zip(frame[MIDSTATE_OFFSET..TAIL_OFFSET].iter().rev())
    {
        *dst = *src;
    }
    let mut data_tail = [0u8; DATA_TAIL_LEN];
    for (dst, src) in data_tail
        .iter_mut()
        .zip(frame[TAIL_OFFSET..TAIL_OFFSET + DATA_TAIL_LEN].iter().rev())
    {
        *dst = *src;
    }
    Some(SubmissionFrame {
        id: u16::from_be_bytes([frame[2], frame[3]]) & WORK_ID_MASK,
        midstate,
        data_tail,
    })
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ReplyHeader {
    pub overflow: bool,
    pub accepted: u16,
}

pub fn decode_header(rx: &[u8]) -> ReplyHeader {
    if rx.len() < REPLY_HEADER_LEN {
        return ReplyHeader::default();
    }
    ReplyHeader {
        overflow: rx[3] & 1 != 0,
        accepted: u16::from_be_bytes([rx[6], rx[7]]),
    }
}

pub fn encode_header(header: ReplyHeader, out: &mut [u8]) {
    out[..REPLY_HEADER_LEN].fill(0);
    out[3] = u8::from(header.overflow);
    out[6..8].copy_from_slice(&header.accepted.to_be_bytes());
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReplyKind {
    NonceFound,
    WorkDone,
}

impl ReplyKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            REPLY_NONCE_FOUND => Some(Self::NonceFound),
            REPLY_WORK_DONE => Some(Self::WorkDone),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::NonceFound => REPLY_NONCE_FOUND,
            Self::WorkDone => REPLY_WORK_DONE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NonceFound => "nonce found",
            Self::WorkDone => "work done",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct CoreAddress {
    pub asic: u8,
    pub core: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReplyRecord {
    pub kind: ReplyKind,
    pub address: CoreAddress,
    pub work_id: u16,
    pub nonce: u32,
}

pub fn reply_tag(record: &[u8]) -> u8 {
    record[0] >> 6
}

pub fn decode_core_address(record: &[u8]) -> CoreAddress {
    CoreAddress {
        asic: (record[0] & 0x38) >> 3,
        core: u32::from_be_bytes([record[8], record[9], record[10], record[11]]),
    }
}

/// The nonce arrives MSB-first on the wire but the boards report it as a
/// little-endian word.
pub fn decode_nonce(field: [u8; 4]) -> u32 {
    u32::from_le(u32::from_be_bytes(field))
}

pub fn encode_nonce(nonce: u32) -> [u8; 4] {
    nonce.to_le().to_be_bytes()
}

pub fn decode_record(record: &[u8]) -> Option<ReplyRecord> {
    if record.len() < REPLY_RECORD_LEN {
        return None;
    }
    let kind = ReplyKind::from_tag(reply_tag(record))?;
    Some(ReplyRecord {
        kind,
        address: decode_core_address(record),
        work_id: u16::from_be_bytes([record[2], record[3]]) & WORK_ID_MASK,
        nonce: decode_nonce([record[4], record[5], record[6], record[7]]),
    })
}

pub fn encode_record(record: &ReplyRecord, out: &mut [u8]) {
    out[..REPLY_RECORD_LEN].fill(0);
    out[0] = (record.kind.tag() << 6) | ((record.address.asic & 0x7) << 3);
    out[2..4].copy_from_slice(&(record.work_id & WORK_ID_MASK).to_be_bytes());
    out[4..8].copy_from_slice(&encode_nonce(record.nonce));
    out[8..12].copy_from_slice(&record.address.core.to_be_bytes());
}

pub fn record_slots(rx: &[u8]) -> impl Iterator<Item = &[u8]> {
    rx.get(REPLY_HEADER_LEN..)
        .unwrap_or_default()
        .chunks_exact(REPLY_RECORD_LEN)
}

#[cfg(test)]
pub fn reply_records(rx: &[u8]) -> impl Iterator<Item = ReplyRecord> + '_ {
    record_slots(rx).filter_map(decode_record)
}
