//! Controller configuration.
//!
//! The configuration is a single JSON object, given either inline on the
//! command line or as a path to a file:
//!
//! ```json
//! {
//!   "sensors": [
//!     { "garagedoor": { "topic": "garage/door", "rate": 60,
//!                       "gpio": { "top": 17, "bot": 27, "act": 22 } } },
//!     { "sm9514": { "topic": "garage/pressure", "rate": 30,
//!                   "press": { "max": 30.0, "min": 0.0 },
//!                   "i2c": { "bus": 1, "addr": 40 } } },
//!     { "w1therm": { "topic": "garage/temp", "rate": 60,
//!                    "sensor": { "id": "0000056f3a2b", "offset": 0.0 } } }
//!   ],
//!   "mqtt": { "clientid": "garage", "host": "10.0.0.2", "port": 8883,
//!             "tls": { "ca": "/etc/ssl/ca.pem",
//!                      "client_ca": "/etc/ssl/garage.pem",
//!                      "client_key": "/etc/ssl/garage.key" } },
//!   "gpio": { "host": "localhost", "port": 8888 }
//! }
//! ```
//!
//! Sensor entries with an unknown kind are skipped with a warning. Any other
//! shape problem is fatal.

use log::{info, warn};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading the configuration. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration is not a JSON object")]
    NotAnObject,

    #[error("\"sensors\" missing from config")]
    MissingSensors,

    #[error("\"sensors\" is not a list")]
    SensorsNotAList,

    #[error("invalid entry {index} in \"sensors\": {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("invalid \"{kind}\" settings: {source}")]
    InvalidSensor {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[error("\"rate\" for \"{topic}\" must be a positive number of seconds")]
    InvalidRate { topic: String },

    #[error("invalid top-level settings: {0}")]
    InvalidSection(serde_json::Error),

    #[error("'{0}' is neither a JSON object nor a file")]
    NotFound(String),

    #[error("'{path}' cannot be opened: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("'{path}' does not contain a valid JSON object: {source}")]
    InvalidJson {
        path: String,
        source: serde_json::Error,
    },
}

/// Complete, validated controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub sensors: Vec<SensorConfig>,
    pub mqtt: MqttConfig,
    pub gpio: GpioConfig,
    pub logging: LoggingConfig,
    pub supervisor: SupervisorConfig,
}

/// Everything except `sensors`, which is validated by hand.
#[derive(Debug, Default, Deserialize)]
struct Sections {
    #[serde(default)]
    mqtt: MqttConfig,
    #[serde(default)]
    gpio: GpioConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clientid: Option<String>,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// TLS material. TLS is enabled only when `ca` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

/// Location of the pigpio daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioConfig {
    #[serde(default = "default_gpio_host")]
    pub host: String,
    #[serde(default = "default_gpio_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `env_logger` filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds to wait for each worker on shutdown before aborting it.
    #[serde(default = "default_stop_grace")]
    pub stop_grace: u64,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_gpio_host() -> String {
    "localhost".to_string()
}

fn default_gpio_port() -> u16 {
    8888
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stop_grace() -> u64 {
    10
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            clientid: None,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: None,
        }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            host: default_gpio_host(),
            port: default_gpio_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: default_stop_grace(),
        }
    }
}

/// MQTT delivery guarantee, serialized as the numeric level 0, 1 or 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DeliveryQos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for DeliveryQos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(format!("qos must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<DeliveryQos> for u8 {
    fn from(qos: DeliveryQos) -> Self {
        match qos {
            DeliveryQos::AtMostOnce => 0,
            DeliveryQos::AtLeastOnce => 1,
            DeliveryQos::ExactlyOnce => 2,
        }
    }
}

impl From<DeliveryQos> for QoS {
    fn from(qos: DeliveryQos) -> Self {
        match qos {
            DeliveryQos::AtMostOnce => QoS::AtMostOnce,
            DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
            DeliveryQos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// One entry of the `sensors` list, keyed by its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorConfig {
    #[serde(rename = "garagedoor")]
    GarageDoor(GarageDoorSettings),
    #[serde(rename = "sm9514")]
    Sm9514(Sm9514Settings),
    #[serde(rename = "w1therm")]
    W1Therm(W1ThermSettings),
}

impl SensorConfig {
    /// Kind keys recognised in the `sensors` list.
    pub const KINDS: [&'static str; 3] = ["garagedoor", "sm9514", "w1therm"];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::GarageDoor(_) => "garagedoor",
            Self::Sm9514(_) => "sm9514",
            Self::W1Therm(_) => "w1therm",
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::GarageDoor(s) => &s.topic,
            Self::Sm9514(s) => &s.topic,
            Self::W1Therm(s) => &s.topic,
        }
    }

    pub fn rate(&self) -> u64 {
        match self {
            Self::GarageDoor(s) => s.rate,
            Self::Sm9514(s) => s.rate,
            Self::W1Therm(s) => s.rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarageDoorSettings {
    pub topic: String,
    /// Heartbeat re-publish interval in seconds.
    pub rate: u64,
    pub gpio: DoorLines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorLines {
    pub top: u32,
    pub bot: u32,
    pub act: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sm9514Settings {
    pub topic: String,
    pub rate: u64,
    pub press: PressureRange,
    pub i2c: I2cAddress,
    #[serde(default)]
    pub qos: DeliveryQos,
}

/// Physical units at the ends of the sensor's output range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureRange {
    pub max: f64,
    pub min: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2cAddress {
    pub bus: u32,
    pub addr: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct W1ThermSettings {
    pub topic: String,
    pub rate: u64,
    pub sensor: W1SensorSettings,
    #[serde(default)]
    pub qos: DeliveryQos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct W1SensorSettings {
    pub id: String,
    pub offset: f64,
    #[serde(default)]
    pub unit: TemperatureUnit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Fahrenheit,
    Celsius,
}

impl Config {
    /// Load the configuration from an inline JSON object or a file path.
    pub fn load(input: &str) -> Result<Self, ConfigError> {
        match serde_json::from_str::<Value>(input) {
            Ok(value) => {
                info!("Configuration parsed from the command line");
                return Self::from_value(value);
            }
            Err(_) => info!("'{}' is not JSON, trying it as a file", input),
        }

        Self::from_file(input)
    }

    /// Load the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        if !path.is_file() {
            return Err(ConfigError::NotFound(display));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: display.clone(),
            source,
        })?;
        let value = serde_json::from_str::<Value>(&content).map_err(|source| {
            ConfigError::InvalidJson {
                path: display.clone(),
                source,
            }
        })?;

        info!("'{}' successfully parsed", display);
        Self::from_value(value)
    }

    /// Validate and convert a parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(mut root) = value else {
            return Err(ConfigError::NotAnObject);
        };

        let sensors = match root.remove("sensors") {
            None => return Err(ConfigError::MissingSensors),
            Some(Value::Array(entries)) => parse_sensors(entries)?,
            Some(_) => return Err(ConfigError::SensorsNotAList),
        };

        let sections: Sections =
            serde_json::from_value(Value::Object(root)).map_err(ConfigError::InvalidSection)?;

        Ok(Self {
            sensors,
            mqtt: sections.mqtt,
            gpio: sections.gpio,
            logging: sections.logging,
            supervisor: sections.supervisor,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn parse_sensors(entries: Vec<Value>) -> Result<Vec<SensorConfig>, ConfigError> {
    let mut sensors = Vec::with_capacity(entries.len());

    for (index, entry) in entries.into_iter().enumerate() {
        let Value::Object(entry) = entry else {
            return Err(ConfigError::InvalidEntry {
                index,
                reason: "not an object".to_string(),
            });
        };
        if entry.len() != 1 {
            return Err(ConfigError::InvalidEntry {
                index,
                reason: format!("expected exactly 1 sensor, found {}", entry.len()),
            });
        }

        let Some((key, settings)) = entry.iter().next() else {
            continue;
        };
        if !settings.is_object() {
            return Err(ConfigError::InvalidEntry {
                index,
                reason: format!("value for \"{key}\" is not an object"),
            });
        }

        let Some(kind) = SensorConfig::KINDS
            .into_iter()
            .find(|k| *k == key.as_str())
        else {
            warn!("Unknown sensor type \"{}\" found in \"sensors\"", key);
            continue;
        };

        let sensor = parse_sensor(kind, entry)?;
        if sensor.rate() == 0 {
            return Err(ConfigError::InvalidRate {
                topic: sensor.topic().to_string(),
            });
        }
        sensors.push(sensor);
    }

    Ok(sensors)
}

fn parse_sensor(kind: &'static str, entry: Map<String, Value>) -> Result<SensorConfig, ConfigError> {
    serde_json::from_value(Value::Object(entry))
        .map_err(|source| ConfigError::InvalidSensor { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn door_entry() -> Value {
        json!({ "garagedoor": {
            "topic": "garage/door",
            "rate": 60,
            "gpio": { "top": 17, "bot": 27, "act": 22 }
        }})
    }

    fn full_config() -> Value {
        json!({
            "sensors": [
                door_entry(),
                { "sm9514": {
                    "topic": "garage/pressure",
                    "rate": 30,
                    "press": { "max": 30.0, "min": 0.0 },
                    "i2c": { "bus": 1, "addr": 40 }
                }},
                { "w1therm": {
                    "topic": "garage/temp",
                    "rate": 60,
                    "sensor": { "id": "0000056f3a2b", "offset": -1.5 },
                    "qos": 1
                }}
            ],
            "mqtt": {
                "clientid": "garage",
                "host": "10.0.0.2",
                "port": 8883,
                "tls": { "ca": "/etc/ssl/ca.pem" }
            },
            "gpio": { "host": "pi.local" }
        })
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_value(full_config()).unwrap();

        assert_eq!(config.sensors.len(), 3);
        assert_eq!(config.sensors[0].kind(), "garagedoor");
        assert_eq!(config.sensors[1].kind(), "sm9514");
        assert_eq!(config.sensors[2].kind(), "w1therm");

        let SensorConfig::GarageDoor(door) = &config.sensors[0] else {
            panic!("expected a garage door");
        };
        assert_eq!(
            door.gpio,
            DoorLines {
                top: 17,
                bot: 27,
                act: 22
            }
        );

        let SensorConfig::W1Therm(therm) = &config.sensors[2] else {
            panic!("expected a thermometer");
        };
        assert_eq!(therm.qos, DeliveryQos::AtLeastOnce);
        assert_eq!(therm.sensor.unit, TemperatureUnit::Fahrenheit);

        assert_eq!(config.mqtt.clientid.as_deref(), Some("garage"));
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.gpio.host, "pi.local");
        assert_eq!(config.gpio.port, 8888);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_value(json!({ "sensors": [] })).unwrap();

        assert!(config.sensors.is_empty());
        assert_eq!(config.mqtt, MqttConfig::default());
        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.gpio.host, "localhost");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.supervisor.stop_grace, 10);
    }

    #[test]
    fn test_unknown_kind_is_skipped() {
        let value = json!({
            "sensors": [
                { "bme280": { "topic": "x", "rate": 1 } },
                door_entry()
            ]
        });

        let config = Config::from_value(value).unwrap();
        assert_eq!(config.sensors.len(), 1);
        assert_eq!(config.sensors[0].topic(), "garage/door");
    }

    #[test]
    fn test_shape_errors_are_fatal() {
        assert!(matches!(
            Config::from_value(json!([])),
            Err(ConfigError::NotAnObject)
        ));
        assert!(matches!(
            Config::from_value(json!({})),
            Err(ConfigError::MissingSensors)
        ));
        assert!(matches!(
            Config::from_value(json!({ "sensors": {} })),
            Err(ConfigError::SensorsNotAList)
        ));
        assert!(matches!(
            Config::from_value(json!({ "sensors": [ "garagedoor" ] })),
            Err(ConfigError::InvalidEntry { index: 0, .. })
        ));
        assert!(matches!(
            Config::from_value(json!({ "sensors": [ door_entry(), {
                "garagedoor": {}, "sm9514": {}
            } ] })),
            Err(ConfigError::InvalidEntry { index: 1, .. })
        ));
        assert!(matches!(
            Config::from_value(json!({ "sensors": [ { "garagedoor": 5 } ] })),
            Err(ConfigError::InvalidEntry { index: 0, .. })
        ));
    }

    #[test]
    fn test_missing_kind_field_is_fatal() {
        let value = json!({ "sensors": [ { "sm9514": { "topic": "p", "rate": 5 } } ] });
        assert!(matches!(
            Config::from_value(value),
            Err(ConfigError::InvalidSensor { kind: "sm9514", .. })
        ));
    }

    #[test]
    fn test_zero_rate_is_fatal() {
        let mut value = json!({ "sensors": [ door_entry() ] });
        value["sensors"][0]["garagedoor"]["rate"] = json!(0);
        assert!(matches!(
            Config::from_value(value),
            Err(ConfigError::InvalidRate { .. })
        ));
    }

    #[test]
    fn test_invalid_qos_is_fatal() {
        let value = json!({ "sensors": [ { "w1therm": {
            "topic": "t", "rate": 5,
            "sensor": { "id": "abc", "offset": 0.0 },
            "qos": 3
        }}]});
        assert!(matches!(
            Config::from_value(value),
            Err(ConfigError::InvalidSensor { kind: "w1therm", .. })
        ));
    }

    #[test]
    fn test_round_trip() {
        let config = Config::from_value(full_config()).unwrap();
        let reparsed = Config::from_value(config.to_value()).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_load_inline_and_file() {
        let inline = Config::load(&full_config().to_string()).unwrap();
        assert_eq!(inline.sensors.len(), 3);

        let path = std::env::temp_dir().join(format!("garage-config-{}.json", std::process::id()));
        std::fs::write(&path, full_config().to_string()).unwrap();
        let from_file = Config::load(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(inline, from_file);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/garage.json"),
            Err(ConfigError::NotFound(_))
        ));
    }
}
