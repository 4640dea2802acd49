//! SM9514 pressure transducer on an I2C bus.
//!
//! The device answers every read with a 4-byte frame. The top two bits of
//! the first byte carry a status code; the remaining 14 bits of the first two
//! bytes are the big-endian bridge output in raw counts.

use super::{Devices, sleep_or_cancel};
use crate::config::{PressureRange, Sm9514Settings};
use crate::error::Result;
use crate::hardware::{BusHandle, HardwareAccess, HardwareError};
use log::{debug, error, info, warn};
use rumqttc::QoS;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Raw output at the bottom of the calibrated range.
pub const OUTPUT_MIN: u16 = 1638;
/// Raw output at the top of the calibrated range.
pub const OUTPUT_MAX: u16 = 14745;

const FRAME_LEN: usize = 4;
const READ_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const STATUS_MASK: u8 = 0xC0;

/// Pause before the next cycle after a rejected reading. The cycle is not
/// restarted immediately so that a permanently failing device cannot keep the
/// task and the daemon connection busy.
const REJECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    CommandMode,
    ConversionInProgress,
    Error,
}

impl Status {
    pub fn from_byte(byte: u8) -> Self {
        match (byte & STATUS_MASK) >> 6 {
            0 => Status::Ok,
            1 => Status::CommandMode,
            2 => Status::ConversionInProgress,
            _ => Status::Error,
        }
    }
}

/// Why a reading was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Reject {
    #[error("short read ({0} of 4 bytes)")]
    ShortRead(usize),

    #[error("device reports an error")]
    DeviceError,

    #[error("device is in command mode")]
    CommandMode,

    #[error("output {0} outside [1638, 14745]")]
    OutOfRange(u16),

    #[error("no answer")]
    NoAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureReading {
    Valid(u16),
    Invalid(Reject),
}

/// Read one frame, retrying while a conversion is in progress.
///
/// Protocol problems are returned as [`PressureReading::Invalid`]; only
/// transport failures are errors.
pub async fn read_counts(
    hardware: &dyn HardwareAccess,
    handle: BusHandle,
) -> std::result::Result<PressureReading, HardwareError> {
    for attempt in 1..=READ_ATTEMPTS {
        let frame = hardware.read_bus_block(handle, FRAME_LEN).await?;
        if frame.len() < FRAME_LEN {
            return Ok(PressureReading::Invalid(Reject::ShortRead(frame.len())));
        }

        match Status::from_byte(frame[0]) {
            Status::Error => return Ok(PressureReading::Invalid(Reject::DeviceError)),
            Status::CommandMode => return Ok(PressureReading::Invalid(Reject::CommandMode)),
            Status::ConversionInProgress => {
                debug!("[SM9514] Stale data on attempt {}", attempt);
                if attempt < READ_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
            Status::Ok => {
                let counts = u16::from_be_bytes([frame[0] & !STATUS_MASK, frame[1]]);
                if (OUTPUT_MIN..=OUTPUT_MAX).contains(&counts) {
                    return Ok(PressureReading::Valid(counts));
                }
                return Ok(PressureReading::Invalid(Reject::OutOfRange(counts)));
            }
        }
    }

    Ok(PressureReading::Invalid(Reject::NoAnswer))
}

/// Rescale raw counts linearly onto `range`, rounded to 3 decimals.
pub fn calibrate(counts: u16, range: &PressureRange) -> f64 {
    let span = f64::from(OUTPUT_MAX - OUTPUT_MIN);
    let offset = f64::from(counts) - f64::from(OUTPUT_MIN);
    let pressure = offset * (range.max - range.min) / span + range.min;
    (pressure * 1000.0).round() / 1000.0
}

pub struct PressureSensor {
    settings: Sm9514Settings,
    devices: Devices,
}

impl PressureSensor {
    pub fn new(settings: Sm9514Settings, devices: Devices) -> Self {
        Self { settings, devices }
    }

    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let i2c = self.settings.i2c;
        info!(
            "[SM9514] sm9514 started for topic '{}' on bus {} addr {:#04x}",
            self.settings.topic, i2c.bus, i2c.addr
        );

        let hardware = self.devices.hardware.as_ref();
        let handle = hardware.open_bus_device(i2c.bus, i2c.addr).await?;

        let result = self.poll_loop(handle, &cancel).await;

        if let Err(e) = hardware.close_bus_device(handle).await {
            warn!("[SM9514] Failed to close bus handle {}: {}", handle.0, e);
        }
        result
    }

    async fn poll_loop(&self, handle: BusHandle, cancel: &CancellationToken) -> Result<()> {
        let hardware = self.devices.hardware.as_ref();
        let rate = Duration::from_secs(self.settings.rate);
        let qos: QoS = self.settings.qos.into();

        while !cancel.is_cancelled() {
            // A read is never interrupted; cancellation is honoured between reads.
            let reading = read_counts(hardware, handle).await?;

            match reading {
                PressureReading::Valid(counts) => {
                    let pressure = calibrate(counts, &self.settings.press);
                    debug!("[SM9514] {} counts = {:.3}", counts, pressure);
                    if let Err(e) = self.devices.broker.publish(
                        &self.settings.topic,
                        format!("{:.3}", pressure),
                        qos,
                    ) {
                        warn!("[SM9514] Failed to publish {}: {}", self.settings.topic, e);
                    }
                    sleep_or_cancel(rate, cancel).await;
                }
                PressureReading::Invalid(reject) => {
                    error!("[SM9514] {} reading discarded: {}", self.settings.topic, reject);
                    sleep_or_cancel(REJECT_BACKOFF, cancel).await;
                }
            }
        }
        Ok(())
    }
}
