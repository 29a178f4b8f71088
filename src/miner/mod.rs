pub mod feeder;
pub mod ui;
