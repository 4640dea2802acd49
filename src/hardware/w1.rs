//! 1-Wire temperature probes through the Linux `w1_therm` sysfs interface.

use super::{ThermometerBus, ThermometerError};
use async_trait::async_trait;
use log::{debug, warn};
use std::path::{Path, PathBuf};

pub const W1_DEVICES_DIR: &str = "/sys/bus/w1/devices";

/// Family codes of the supported thermometer chips
/// (DS18S20, DS1822, DS18B20, DS1825, DS28EA00).
const THERM_FAMILIES: [&str; 5] = ["10", "22", "28", "3b", "42"];

/// Power-on reset value of the DS18x20 family, never a real reading.
const RESET_VALUE_MILLI_C: i64 = 85_000;

pub struct W1Bus {
    base: PathBuf,
}

impl W1Bus {
    /// Open the bus if the kernel driver is loaded.
    pub fn probe(base: impl Into<PathBuf>) -> Option<Self> {
        let base = base.into();
        if base.is_dir() {
            Some(Self { base })
        } else {
            warn!(
                "[W1] Cannot load 1-Wire driver ({} is missing)",
                base.display()
            );
            None
        }
    }

    async fn device_dir(&self, id: &str) -> Result<PathBuf, ThermometerError> {
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some((family, device_id)) = split_device_name(&name.to_string_lossy())
                && device_id == id
                && is_thermometer(&family)
            {
                return Ok(entry.path());
            }
        }
        Err(ThermometerError::NotFound(id.to_string()))
    }
}

fn split_device_name(name: &str) -> Option<(String, String)> {
    let (family, id) = name.split_once('-')?;
    Some((family.to_lowercase(), id.to_string()))
}

fn is_thermometer(family: &str) -> bool {
    THERM_FAMILIES.contains(&family)
}

/// Parse the two-line `w1_slave` report into degrees Celsius.
fn parse_w1_slave(id: &str, content: &str) -> Result<f64, ThermometerError> {
    let mut lines = content.lines();

    let crc_ok = lines
        .next()
        .is_some_and(|line| line.trim_end().ends_with("YES"));
    if !crc_ok {
        return Err(ThermometerError::NotReady(id.to_string()));
    }

    let milli = lines
        .next()
        .and_then(|line| line.split_once("t="))
        .and_then(|(_, value)| value.trim().parse::<i64>().ok())
        .ok_or_else(|| ThermometerError::Malformed(id.to_string()))?;

    if milli == RESET_VALUE_MILLI_C {
        return Err(ThermometerError::ResetValue(id.to_string()));
    }

    Ok(milli as f64 / 1000.0)
}

#[async_trait]
impl ThermometerBus for W1Bus {
    async fn sensor_ids(&self) -> Result<Vec<String>, ThermometerError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some((family, id)) = split_device_name(&entry.file_name().to_string_lossy())
                && is_thermometer(&family)
            {
                ids.push(id);
            }
        }
        ids.sort();
        debug!("[W1] Visible sensors: {:?}", ids);
        Ok(ids)
    }

    async fn read_celsius(&self, id: &str) -> Result<f64, ThermometerError> {
        let dir = self.device_dir(id).await?;
        let content = tokio::fs::read_to_string(Path::new(&dir).join("w1_slave")).await?;
        parse_w1_slave(id, &content)
    }
}
