pub const REQ_SUBMIT_WORK: u8 = 2;
pub const REQ_FLUSH_QUEUE: u8 = 3;

pub const REPLY_NONCE_FOUND: u8 = 1;
pub const REPLY_WORK_DONE: u8 = 2;

pub const TRANSACTION_LEN: usize = 0x1000;
pub const REQUEST_FRAME_LEN: usize = 0x30;
pub const REPLY_HEADER_LEN: usize = 0xc;
pub const REPLY_RECORD_LEN: usize = 0xc;

/// Filler byte; its command nibble is 0, which the boards ignore.
pub const NOP_BYTE: u8 = 0x04;

pub const WORK_ID_BITS: u32 = 15;
pub const WORK_ID_MASK: u16 = (1 << WORK_ID_BITS) - 1;
pub const WORK_ID_SPACE: usize = 1 << WORK_ID_BITS;

pub const MIDSTATE_LEN: usize = 32;
pub const DATA_LEN: usize = 80;
pub const DATA_TAIL_OFFSET: usize = 0x40;
pub const DATA_TAIL_LEN: usize = 12;

pub const HASHES_PER_WORK: u64 = 1 << 32;

pub const CORES_PER_BOARD: usize = 192;
pub const CORE_STATUS_OK: u8 = 3;
pub const CORE_STATUS_BLOCK_LEN: usize = 0x20;
pub const BOARD_SLAVE_FIRST: u16 = 0x20;
pub const BOARD_SLAVE_LAST: u16 = 0x26;
pub const THERMAL_SLAVE: u16 = 0x48;
pub const THERMAL_BUS_OFFSET: u32 = 3;

pub const SPI_SPEED_HZ: u32 = 3_000_000;
pub const SPI_DELAY_USECS: u16 = 0;
pub const SPI_BITS_PER_WORD: u8 = 8;
pub const POLL_INTERVAL_US: u64 = 10_000;

pub const fn command_byte(command: u8) -> u8 {
    command << 4
}

pub const fn frames_per_transaction() -> usize {
    TRANSACTION_LEN / REQUEST_FRAME_LEN
}
