use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorType {
    HeartRate,
    SpO2,
    Temperature,
    Battery,
    Emg,
    PpgRed,
    PpgInfrared,
    PpgGreen,
    AccelerometerX,
    AccelerometerY,
    AccelerometerZ,
}

impl SensorType {
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::HeartRate => "bpm",
            SensorType::SpO2 | SensorType::Battery => "%",
            SensorType::Temperature => "°C",
            SensorType::Emg => "µV",
            SensorType::PpgRed | SensorType::PpgInfrared | SensorType::PpgGreen => "counts",
            SensorType::AccelerometerX
            | SensorType::AccelerometerY
            | SensorType::AccelerometerZ => "g",
        }
    }

    /// Physiologically plausible range for a reading of this type
    pub fn valid_range(&self) -> RangeInclusive<f64> {
        match self {
            SensorType::HeartRate => 30.0..=250.0,
            SensorType::SpO2 => 50.0..=100.0,
            SensorType::Temperature => 20.0..=45.0,
            SensorType::Battery => 0.0..=100.0,
            SensorType::Emg => 0.0..=65535.0,
            SensorType::PpgRed | SensorType::PpgInfrared | SensorType::PpgGreen => {
                0.0..=16_777_215.0
            }
            SensorType::AccelerometerX
            | SensorType::AccelerometerY
            | SensorType::AccelerometerZ => -16.0..=16.0,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorType::HeartRate => "heart_rate",
            SensorType::SpO2 => "spo2",
            SensorType::Temperature => "temperature",
            SensorType::Battery => "battery",
            SensorType::Emg => "emg",
            SensorType::PpgRed => "ppg_red",
            SensorType::PpgInfrared => "ppg_infrared",
            SensorType::PpgGreen => "ppg_green",
            SensorType::AccelerometerX => "accelerometer_x",
            SensorType::AccelerometerY => "accelerometer_y",
            SensorType::AccelerometerZ => "accelerometer_z",
        };
        f.write_str(name)
    }
}

/// A single decoded measurement. Produced by the characteristic parsers and
/// never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub id: Uuid,
    pub sensor_type: SensorType,
    pub value: f64,
    pub timestamp: OffsetDateTime,
    pub device_id: Option<String>,
    pub quality: Option<f64>,
}

impl SensorReading {
    pub fn new(
        sensor_type: SensorType,
        value: f64,
        timestamp: OffsetDateTime,
        device_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sensor_type,
            value,
            timestamp,
            device_id,
            quality: None,
        }
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality.clamp(0.0, 1.0));
        self
    }

    pub fn is_valid(&self) -> bool {
        self.sensor_type.valid_range().contains(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// PPG wearable reporting heart rate, SpO2 and temperature
    Oralable,
    /// EMG muscle activity sensor
    AnrMuscleSense,
}

impl DeviceType {
    /// Prefix of the advertised local name
    pub fn name_prefix(&self) -> &'static str {
        match self {
            DeviceType::Oralable => "Oralable",
            DeviceType::AnrMuscleSense => "ANR",
        }
    }

    pub fn supports(&self, sensor_type: SensorType) -> bool {
        crate::bluetooth::uuids::characteristic_for(*self, sensor_type).is_some()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Oralable => f.write_str("Oralable"),
            DeviceType::AnrMuscleSense => f.write_str("ANR MuscleSense"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oralable" => Ok(DeviceType::Oralable),
            "anr" | "anr_muscle_sense" | "musclesense" => Ok(DeviceType::AnrMuscleSense),
            other => Err(format!("Unknown device type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    ConnectionFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub name: String,
    pub peripheral_identifier: String,
    pub connection_state: ConnectionState,
    pub battery_level: Option<u8>,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
    pub signal_strength: Option<i16>,
}

impl DeviceInfo {
    pub fn new(device_type: DeviceType, name: String, peripheral_identifier: String) -> Self {
        Self {
            device_type,
            name,
            peripheral_identifier,
            connection_state: ConnectionState::Disconnected,
            battery_level: None,
            firmware_version: None,
            hardware_version: None,
            signal_strength: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfiguration {
    pub sampling_rate: u32,
    pub enabled_sensors: BTreeSet<SensorType>,
    pub auto_reconnect: bool,
    pub notifications_enabled: bool,
    pub buffer_size: usize,
}

impl DeviceConfiguration {
    pub fn preset(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Oralable => Self {
                sampling_rate: 50,
                enabled_sensors: BTreeSet::from([
                    SensorType::HeartRate,
                    SensorType::SpO2,
                    SensorType::Temperature,
                    SensorType::Battery,
                ]),
                auto_reconnect: true,
                notifications_enabled: true,
                buffer_size: 512,
            },
            DeviceType::AnrMuscleSense => Self {
                sampling_rate: 100,
                enabled_sensors: BTreeSet::from([SensorType::Emg, SensorType::Battery]),
                auto_reconnect: true,
                notifications_enabled: true,
                buffer_size: 1024,
            },
        }
    }

    pub fn validate(&self, device_type: DeviceType) -> Result<(), DeviceError> {
        if self.sampling_rate == 0 {
            return Err(DeviceError::Unknown("sampling rate must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(DeviceError::Unknown("buffer size must be positive".into()));
        }
        if let Some(sensor) = self
            .enabled_sensors
            .iter()
            .find(|sensor| !device_type.supports(**sensor))
        {
            return Err(DeviceError::UnsupportedSensor(*sensor));
        }
        Ok(())
    }
}
