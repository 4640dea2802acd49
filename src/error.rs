use thiserror::Error as ThisError;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::hardware::{HardwareError, ThermometerError};
use crate::instance_lock::LifecycleError;

#[derive(ThisError, Debug)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Hardware access failed: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Thermometer failed: {0}")]
    Thermometer(#[from] ThermometerError),

    #[error("Message broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
