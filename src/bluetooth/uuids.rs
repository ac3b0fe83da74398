/// GATT service and characteristic identifiers used by the supported wearables
use uuid::Uuid;

use crate::models::{DeviceType, SensorType};

/// Expand a Bluetooth SIG 16-bit UUID onto the base UUID
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | ((short as u128) << 96))
}

pub const HEART_RATE_SERVICE: Uuid = sig_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = sig_uuid(0x2A37);
pub const BATTERY_SERVICE: Uuid = sig_uuid(0x180F);
pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);
pub const HEALTH_THERMOMETER_SERVICE: Uuid = sig_uuid(0x1809);
pub const TEMPERATURE_MEASUREMENT: Uuid = sig_uuid(0x2A1C);
pub const PULSE_OXIMETER_SERVICE: Uuid = sig_uuid(0x1822);
pub const PLX_CONTINUOUS_MEASUREMENT: Uuid = sig_uuid(0x2A5F);
pub const DEVICE_INFORMATION_SERVICE: Uuid = sig_uuid(0x180A);
pub const FIRMWARE_REVISION: Uuid = sig_uuid(0x2A26);
pub const HARDWARE_REVISION: Uuid = sig_uuid(0x2A27);

// Vendor control service; commands are written raw to the command characteristic
pub const CONTROL_SERVICE: Uuid = Uuid::from_u128(0x6f72_6c00_5c1e_4b6e_9d5b_1f0a_c3e2_d001);
pub const COMMAND: Uuid = Uuid::from_u128(0x6f72_6c01_5c1e_4b6e_9d5b_1f0a_c3e2_d001);

/// Services discovered after connecting
pub fn services(device_type: DeviceType) -> &'static [Uuid] {
    match device_type {
        DeviceType::Oralable => &[
            HEART_RATE_SERVICE,
            HEALTH_THERMOMETER_SERVICE,
            PULSE_OXIMETER_SERVICE,
            BATTERY_SERVICE,
            DEVICE_INFORMATION_SERVICE,
            CONTROL_SERVICE,
        ],
        DeviceType::AnrMuscleSense => &[
            HEART_RATE_SERVICE,
            BATTERY_SERVICE,
            DEVICE_INFORMATION_SERVICE,
            CONTROL_SERVICE,
        ],
    }
}

/// Services carrying the expected characteristics
pub fn required_services(device_type: DeviceType) -> &'static [Uuid] {
    match device_type {
        DeviceType::Oralable => &[HEART_RATE_SERVICE, HEALTH_THERMOMETER_SERVICE, BATTERY_SERVICE],
        DeviceType::AnrMuscleSense => &[HEART_RATE_SERVICE, BATTERY_SERVICE],
    }
}

/// Characteristics that must be discovered before the device counts as connected
pub fn expected_characteristics(device_type: DeviceType) -> &'static [Uuid] {
    match device_type {
        DeviceType::Oralable => &[HEART_RATE_MEASUREMENT, TEMPERATURE_MEASUREMENT, BATTERY_LEVEL],
        // EMG is carried on the heart rate measurement characteristic
        DeviceType::AnrMuscleSense => &[HEART_RATE_MEASUREMENT, BATTERY_LEVEL],
    }
}

pub fn characteristic_for(device_type: DeviceType, sensor_type: SensorType) -> Option<Uuid> {
    match (device_type, sensor_type) {
        (_, SensorType::Battery) => Some(BATTERY_LEVEL),
        (DeviceType::Oralable, SensorType::HeartRate) => Some(HEART_RATE_MEASUREMENT),
        (DeviceType::Oralable, SensorType::Temperature) => Some(TEMPERATURE_MEASUREMENT),
        (DeviceType::Oralable, SensorType::SpO2) => Some(PLX_CONTINUOUS_MEASUREMENT),
        (DeviceType::AnrMuscleSense, SensorType::Emg) => Some(HEART_RATE_MEASUREMENT),
        _ => None,
    }
}
