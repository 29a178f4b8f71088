use anyhow::{bail, Result};
use knc_wire_spec::{
    BOARD_SLAVE_FIRST, BOARD_SLAVE_LAST, CORES_PER_BOARD, CORE_STATUS_BLOCK_LEN, CORE_STATUS_OK,
};
use log::{debug, info, warn};

use crate::device::cores::{CoreMap, CoreMapBuilder};
use crate::i2c::ControlBus;

/// Reads every core status byte of the board at `slave`. `None` when the
/// slave does not answer or reports no working core in its first block.
pub fn probe_board(control: &mut dyn ControlBus, slave: u16) -> Option<Vec<u8>> {
    if let Err(err) = control.select_slave(slave) {
        debug!("slave {slave:#04x}: {err}");
        return None;
    }

    let mut statuses = vec![0u8; CORES_PER_BOARD];
    let (first, rest) = statuses.split_at_mut(CORE_STATUS_BLOCK_LEN);
    if let Err(err) = control.read_block(0, first) {
        debug!("slave {slave:#04x}: {err}");
        return None;
    }
    if !first.contains(&CORE_STATUS_OK) {
        debug!("slave {slave:#04x}: no working cores in first status block");
        return None;
    }

    for (block, chunk) in rest.chunks_mut(CORE_STATUS_BLOCK_LEN).enumerate() {
        let register = ((block + 1) * CORE_STATUS_BLOCK_LEN) as u8;
        if let Err(err) = control.read_block(register, chunk) {
            warn!("slave {slave:#04x}: status block {register:#04x} unreadable, cores disabled: {err}");
            chunk.fill(0);
        }
    }
    Some(statuses)
}

pub fn discover(
    control: &mut dyn ControlBus,
    slaves: impl IntoIterator<Item = u16>,
    mut accumulator: CoreMapBuilder,
) -> Result<CoreMap> {
    for slave in slaves {
        if !(BOARD_SLAVE_FIRST..=BOARD_SLAVE_LAST).contains(&slave) {
            warn!("slave {slave:#04x} is outside the board address range, skipping");
            continue;
        }
        let Some(statuses) = probe_board(control, slave) else {
            continue;
        };
        let asic = (slave - BOARD_SLAVE_FIRST) as u8;
        let enabled = statuses.iter().filter(|s| **s == CORE_STATUS_OK).count();
        info!(
            "asic {asic} at {slave:#04x}: {enabled}/{} cores enabled",
            statuses.len()
        );
        accumulator.push_board(asic, &statuses)?;
    }

    if accumulator.boards() == 0 {
        bail!("no boards answered on the control bus");
    }
    Ok(accumulator.build())
}
