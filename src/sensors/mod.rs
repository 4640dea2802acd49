//! Sensor workers.
//!
//! Every configured sensor runs as its own tokio task with its own poll loop.
//! The three kinds share one lifecycle ([`Worker::start`] / [`Worker::stop`])
//! and differ only in what a poll does:
//!
//! - `garagedoor`: samples two limit switches every 0.5 s, tracks the door
//!   state and pulses the actuator on request
//! - `sm9514`: reads the I2C pressure transducer every `rate` seconds
//! - `w1therm`: reads a 1-Wire probe every `rate` seconds

pub mod garage_door;
pub mod pressure;
pub mod thermometer;

pub use garage_door::{DoorState, GarageDoor};
pub use pressure::PressureSensor;
pub use thermometer::Thermometer;

use crate::broker::MessageBroker;
use crate::config::SensorConfig;
use crate::error::Result;
use crate::hardware::{HardwareAccess, ThermometerBus};
use log::{error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Process-wide collaborators handed to every worker.
#[derive(Clone)]
pub struct Devices {
    pub broker: Arc<dyn MessageBroker>,
    pub hardware: Arc<dyn HardwareAccess>,
    /// `None` when the 1-Wire driver is not loaded on this host.
    pub thermometers: Option<Arc<dyn ThermometerBus>>,
}

/// One sensor of a known kind, ready to run.
pub enum Sensor {
    GarageDoor(GarageDoor),
    Pressure(PressureSensor),
    Thermometer(Thermometer),
}

impl Sensor {
    pub fn new(config: &SensorConfig, devices: &Devices) -> Self {
        match config {
            SensorConfig::GarageDoor(settings) => {
                Sensor::GarageDoor(GarageDoor::new(settings.clone(), devices.clone()))
            }
            SensorConfig::Sm9514(settings) => {
                Sensor::Pressure(PressureSensor::new(settings.clone(), devices.clone()))
            }
            SensorConfig::W1Therm(settings) => {
                Sensor::Thermometer(Thermometer::new(settings.clone(), devices.clone()))
            }
        }
    }

    /// Run the poll loop until cancelled, the kind turns out to be
    /// unsupported on this host (`Ok`), or an error occurs (`Err`).
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        match self {
            Sensor::GarageDoor(door) => door.run(cancel).await,
            Sensor::Pressure(sensor) => sensor.run(cancel).await,
            Sensor::Thermometer(sensor) => sensor.run(cancel).await,
        }
    }
}

/// Describe a configured sensor for log lines.
pub fn describe(config: &SensorConfig) -> String {
    format!("{} '{}'", config.kind(), config.topic())
}

/// A running sensor task.
pub struct Worker {
    name: String,
    cancel: CancellationToken,
    retired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn the sensor's poll loop on the runtime.
    pub fn start(name: String, sensor: Sensor) -> Self {
        let cancel = CancellationToken::new();
        let retired = Arc::new(AtomicBool::new(false));

        let task_name = name.clone();
        let task_cancel = cancel.clone();
        let task_retired = retired.clone();
        let handle = tokio::spawn(async move {
            match sensor.run(task_cancel.clone()).await {
                Ok(()) if task_cancel.is_cancelled() => {
                    info!("[Worker] {} stopped", task_name);
                }
                Ok(()) => {
                    info!("[Worker] {} is unsupported on this host, retiring", task_name);
                    task_retired.store(true, Ordering::SeqCst);
                }
                Err(e) => error!("[Worker] {} failed: {}", task_name, e),
            }
        });

        Self {
            name,
            cancel,
            retired,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// The task ended on its own without an error because this host cannot
    /// serve the sensor at all (no 1-Wire driver). Such a worker is not
    /// restarted.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Signal cancellation and wait for the task to exit, aborting it if it
    /// does not finish within `grace`.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();

        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!("[Worker] {} panicked", self.name),
            Ok(Err(_)) => {}
            Err(_) => {
                error!(
                    "[Worker] {} did not stop within {:?}, aborting",
                    self.name, grace
                );
                handle.abort();
            }
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns `true` if cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryQos, TemperatureUnit, W1SensorSettings, W1ThermSettings};
    use crate::testing::{FakeBroker, FakeHardware, FakeThermometers};

    fn devices(thermometers: Option<Arc<dyn ThermometerBus>>) -> Devices {
        Devices {
            broker: Arc::new(FakeBroker::new()),
            hardware: Arc::new(FakeHardware::new()),
            thermometers,
        }
    }

    fn thermometer(devices: &Devices) -> Sensor {
        Sensor::new(
            &SensorConfig::W1Therm(W1ThermSettings {
                topic: "garage/temp".to_string(),
                rate: 60,
                sensor: W1SensorSettings {
                    id: "abc".to_string(),
                    offset: 0.0,
                    unit: TemperatureUnit::Celsius,
                },
                qos: DeliveryQos::AtMostOnce,
            }),
            devices,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_joins_running_worker() {
        let thermometers: Arc<dyn ThermometerBus> = Arc::new(FakeThermometers::new(&["abc"], 20.0));
        let devices = devices(Some(thermometers));
        let worker = Worker::start("temp".to_string(), thermometer(&devices));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(worker.is_alive());

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_device_retires_worker() {
        let devices = devices(None);
        let worker = Worker::start("temp".to_string(), thermometer(&devices));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!worker.is_alive());
        assert!(worker.is_retired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(!sleep_or_cancel(Duration::from_secs(1), &cancel).await);

        cancel.cancel();
        assert!(sleep_or_cancel(Duration::from_secs(3600), &cancel).await);
    }
}
