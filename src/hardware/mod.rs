//! Hardware access seams.
//!
//! [`HardwareAccess`] covers digital lines and block reads from addressed
//! I2C devices; [`ThermometerBus`] covers 1-Wire temperature probes. Both are
//! shared by every worker and must be safe to call concurrently; the concrete
//! adapters serialise internally where the underlying transport needs it.

mod pigpio;
mod w1;

pub use pigpio::PigpioClient;
pub use w1::{W1_DEVICES_DIR, W1Bus};

use async_trait::async_trait;
use thiserror::Error;

use crate::instance_lock::LifecycleError;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("cannot reach GPIO daemon at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("GPIO daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPIO daemon rejected command {command} with error {code}")]
    Daemon { command: u32, code: i32 },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Error)]
pub enum ThermometerError {
    #[error("1-Wire I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sensor {0} is not present")]
    NotFound(String),

    #[error("sensor {0} is not ready (CRC check failed)")]
    NotReady(String),

    #[error("sensor {0} returned the power-on reset value")]
    ResetValue(String),

    #[error("sensor {0} returned malformed data")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

/// Handle of an opened I2C device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusHandle(pub u32);

#[async_trait]
pub trait HardwareAccess: Send + Sync {
    async fn set_line_mode(&self, line: u32, mode: LineMode) -> Result<(), HardwareError>;

    async fn write_line(&self, line: u32, level: Level) -> Result<(), HardwareError>;

    async fn read_line(&self, line: u32) -> Result<Level, HardwareError>;

    async fn open_bus_device(&self, bus: u32, addr: u32) -> Result<BusHandle, HardwareError>;

    /// Read up to `count` bytes. The returned buffer may be shorter.
    async fn read_bus_block(
        &self,
        handle: BusHandle,
        count: usize,
    ) -> Result<Vec<u8>, HardwareError>;

    async fn close_bus_device(&self, handle: BusHandle) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait ThermometerBus: Send + Sync {
    /// Ids of the probes currently visible on the bus.
    async fn sensor_ids(&self) -> Result<Vec<String>, ThermometerError>;

    async fn read_celsius(&self, id: &str) -> Result<f64, ThermometerError>;
}
