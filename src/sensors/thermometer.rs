//! 1-Wire temperature probe.

use super::{Devices, sleep_or_cancel};
use crate::config::{TemperatureUnit, W1ThermSettings};
use crate::error::Result;
use crate::hardware::ThermometerError;
use log::{debug, info, warn};
use rumqttc::QoS;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Thermometer {
    settings: W1ThermSettings,
    devices: Devices,
}

impl Thermometer {
    pub fn new(settings: W1ThermSettings, devices: Devices) -> Self {
        Self { settings, devices }
    }

    /// Convert a Celsius reading to the configured unit and apply the offset.
    fn adjust(&self, celsius: f64) -> f64 {
        let value = match self.settings.sensor.unit {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        };
        value + self.settings.sensor.offset
    }

    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let topic = &self.settings.topic;
        let id = &self.settings.sensor.id;

        let Some(bus) = self.devices.thermometers.clone() else {
            warn!("[W1] No 1-Wire driver, w1therm '{}' disabled", topic);
            return Ok(());
        };

        // A sensor that is not visible yet is retried by the supervisor.
        let visible = bus.sensor_ids().await?;
        if !visible.iter().any(|known| known == id) {
            return Err(ThermometerError::NotFound(id.clone()).into());
        }
        info!("[W1] w1therm started for topic '{}' with sensor {}", topic, id);

        let rate = Duration::from_secs(self.settings.rate);
        let qos: QoS = self.settings.qos.into();

        while !cancel.is_cancelled() {
            let celsius = bus.read_celsius(id).await?;
            let value = self.adjust(celsius);
            debug!("[W1] {} reads {:.3} C, publishing {:.1}", id, celsius, value);

            if let Err(e) = self
                .devices
                .broker
                .publish(topic, format!("{:5.1}", value), qos)
            {
                warn!("[W1] Failed to publish {}: {}", topic, e);
            }

            if sleep_or_cancel(rate, &cancel).await {
                break;
            }
        }
        Ok(())
    }
}
