use std::path::PathBuf;

use knc_wire_spec::{THERMAL_BUS_OFFSET, THERMAL_SLAVE};
use log::debug;

use crate::i2c::{ControlBus, ControlBusError, I2cDev};

/// The sensor reports whole degrees in the low byte and a half-degree flag
/// in bit 8.
pub fn decode_temperature(raw: u16) -> f32 {
    let mut celsius = f32::from((raw & 0xff) as u8);
    if raw & 0x100 != 0 {
        celsius += 0.5;
    }
    celsius
}

pub fn thermal_bus_path(asic: u8) -> PathBuf {
    PathBuf::from(format!("/dev/i2c-{}", u32::from(asic) + THERMAL_BUS_OFFSET))
}

pub fn read_board_temperature(control: &mut dyn ControlBus) -> Result<f32, ControlBusError> {
    control.select_slave(THERMAL_SLAVE)?;
    let raw = control.read_word(0)?;
    Ok(decode_temperature(raw))
}

pub fn read_temperatures(asics: impl IntoIterator<Item = u8>) -> Vec<(u8, f32)> {
    let mut readings = Vec::new();
    for asic in asics {
        let path = thermal_bus_path(asic);
        let reading = I2cDev::open(&path).and_then(|mut dev| read_board_temperature(&mut dev));
        match reading {
            Ok(celsius) => readings.push((asic, celsius)),
            Err(err) => debug!("asic {asic}: temperature unavailable: {err}"),
        }
    }
    readings
}
