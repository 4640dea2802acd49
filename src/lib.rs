//! Garage controller library.
//!
//! Supervises a small set of sensor workers (garage door, pressure
//! transducer, 1-Wire thermometer) that read hardware through the pigpio
//! daemon or sysfs and publish to an MQTT broker.

pub mod broker;
pub mod config;
pub mod error;
pub mod hardware;
pub mod instance_lock;
pub mod logging;
pub mod sensors;
pub mod supervisor;

#[cfg(test)]
mod testing;
