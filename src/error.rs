use thiserror::Error;
use uuid::Uuid;

use crate::models::SensorType;

/// Failures raised by a device object or its transport
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("Device is not connected")]
    NotConnected,
    #[error("Invalid peripheral: {0}")]
    InvalidPeripheral(String),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("Failed to write command: {0}")]
    WriteCommandFailed(String),
    #[error("Failed to read characteristic: {0}")]
    ReadFailed(String),
    #[error("Failed to parse data: {0}")]
    DataParsingFailed(String),
    #[error("Sensor {0} is not supported by this device")]
    UnsupportedSensor(SensorType),
    #[error("Operation timed out")]
    Timeout,
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Top-level service errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl From<bluer::Error> for DeviceError {
    fn from(err: bluer::Error) -> Self {
        DeviceError::Unknown(err.to_string())
    }
}
