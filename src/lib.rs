//! Meter to Hub4 gateway library
//!
//! Polls Carlo Gavazzi energy meters over a shared Modbus RTU bus and runs
//! the Hub4 grid setpoint control loop on top of the readings.

pub mod models;
pub mod config;
pub mod metering_modbus;
pub mod hub4;
#[cfg(feature = "mqtt")]
pub mod mqtt;

// Re-export common types for easier access
pub use config::{ConfigHolder, SharedConfig};
pub use metering_modbus::{ModbusManager, MeterSnapshot};
pub use hub4::Hub4Manager;
