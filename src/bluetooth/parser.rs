/// Decoding of notified GATT characteristic payloads into sensor readings
use log::debug;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::bluetooth::uuids::{
    BATTERY_LEVEL, HEART_RATE_MEASUREMENT, PLX_CONTINUOUS_MEASUREMENT, TEMPERATURE_MEASUREMENT,
};
use crate::models::{DeviceType, SensorReading, SensorType};

// Heart rate measurement flag bits
const FLAG_VALUE_U16: u8 = 0x01;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

// Temperature measurement flag bits
const FLAG_FAHRENHEIT: u8 = 0x01;

/// Spacing of EMG sub-samples packed into one notification (100 Hz)
pub const EMG_SAMPLE_INTERVAL_MS: i64 = 10;

/// Read the leading flagged value shared by the heart-rate-measurement format
///
/// Returns the value and the offset of the first unconsumed byte, or None
/// when the buffer is too short for the format announced by the flags.
fn read_flagged_value(data: &[u8]) -> Option<(u16, usize)> {
    let flags = *data.first()?;
    if flags & FLAG_VALUE_U16 != 0 {
        let bytes = data.get(1..3)?;
        Some((u16::from_le_bytes([bytes[0], bytes[1]]), 3))
    } else {
        data.get(1).map(|value| (*value as u16, 2))
    }
}

/// Decode an EMG notification from the ANR MuscleSense
///
/// The payload uses the heart rate measurement layout:
/// - Byte 0: Flags (bit 0 set: first value is 16-bit)
/// - Byte 1 or bytes 1-2: First EMG sample (u8, or little-endian u16)
/// - Remaining bytes: Further EMG samples, little-endian u16 each
///
/// The first sample is stamped `base_timestamp`; trailing sample `k` is
/// stamped `k * 10 ms` later. Buffers too short for the first value decode to
/// nothing, and a dangling odd byte at the end is ignored.
pub fn parse_emg_data(
    data: &[u8],
    base_timestamp: OffsetDateTime,
    device_id: Option<&str>,
) -> Vec<SensorReading> {
    let Some((first, offset)) = read_flagged_value(data) else {
        return Vec::new();
    };

    let mut readings = vec![SensorReading::new(
        SensorType::Emg,
        first as f64,
        base_timestamp,
        device_id.map(str::to_owned),
    )];

    for (index, chunk) in data[offset..].chunks_exact(2).enumerate() {
        let sample = u16::from_le_bytes([chunk[0], chunk[1]]);
        let timestamp =
            base_timestamp + Duration::milliseconds(EMG_SAMPLE_INTERVAL_MS * (index as i64 + 1));
        readings.push(SensorReading::new(
            SensorType::Emg,
            sample as f64,
            timestamp,
            device_id.map(str::to_owned),
        ));
    }

    readings
}

/// Decode a battery level notification: byte 0 is the charge percentage
pub fn parse_battery_data(
    data: &[u8],
    timestamp: OffsetDateTime,
    device_id: Option<&str>,
) -> Option<SensorReading> {
    data.first().map(|level| {
        SensorReading::new(
            SensorType::Battery,
            *level as f64,
            timestamp,
            device_id.map(str::to_owned),
        )
    })
}

/// Decode a standard heart rate measurement (0x2A37)
///
/// - Byte 0: Flags
///   - bit 0: value format (u8 / u16)
///   - bits 1-2: sensor contact status
///   - bit 3: energy expended present (u16, skipped)
///   - bit 4: RR intervals present (u16 each, 1/1024 s)
/// - Then the heart rate value, energy expended and RR intervals
///
/// Quality is 0 when contact is supported but lost, otherwise derived from how
/// many RR intervals backed the measurement.
pub fn parse_heart_rate_data(
    data: &[u8],
    timestamp: OffsetDateTime,
    device_id: Option<&str>,
) -> Option<SensorReading> {
    let (bpm, mut offset) = read_flagged_value(data)?;
    let flags = data[0];

    if flags & FLAG_ENERGY_EXPENDED != 0 {
        offset += 2;
    }

    let reading = SensorReading::new(
        SensorType::HeartRate,
        bpm as f64,
        timestamp,
        device_id.map(str::to_owned),
    );

    let contact_lost =
        flags & FLAG_CONTACT_SUPPORTED != 0 && flags & FLAG_CONTACT_DETECTED == 0;
    if contact_lost {
        return Some(reading.with_quality(0.0));
    }

    if flags & FLAG_RR_INTERVALS != 0 {
        let rr_count = data.len().saturating_sub(offset) / 2;
        return Some(reading.with_quality(rr_count as f64 / 2.0));
    }

    Some(reading)
}

/// Decode a standard temperature measurement (0x2A1C)
///
/// - Byte 0: Flags (bit 0 set: Fahrenheit)
/// - Bytes 1-4: IEEE-11073 32-bit FLOAT
///
/// Values are always reported in Celsius.
pub fn parse_temperature_data(
    data: &[u8],
    timestamp: OffsetDateTime,
    device_id: Option<&str>,
) -> Option<SensorReading> {
    let flags = *data.first()?;
    let raw = data.get(1..5)?;
    let value = float_to_f64(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))?;

    let celsius = if flags & FLAG_FAHRENHEIT != 0 {
        (value - 32.0) * 5.0 / 9.0
    } else {
        value
    };

    Some(SensorReading::new(
        SensorType::Temperature,
        (celsius * 100.0).round() / 100.0,
        timestamp,
        device_id.map(str::to_owned),
    ))
}

/// Decode a PLX continuous measurement (0x2A5F)
///
/// - Byte 0: Flags (optional trailing fields are not decoded)
/// - Bytes 1-2: SpO2 (SFLOAT, percent)
/// - Bytes 3-4: Pulse rate (SFLOAT, bpm)
pub fn parse_spo2_data(
    data: &[u8],
    timestamp: OffsetDateTime,
    device_id: Option<&str>,
) -> Vec<SensorReading> {
    let Some(raw) = data.get(1..5) else {
        return Vec::new();
    };

    let spo2 = sfloat_to_f64(u16::from_le_bytes([raw[0], raw[1]]));
    let pulse_rate = sfloat_to_f64(u16::from_le_bytes([raw[2], raw[3]]));

    [(SensorType::SpO2, spo2), (SensorType::HeartRate, pulse_rate)]
        .into_iter()
        .filter_map(|(sensor_type, value)| {
            value.map(|value| {
                SensorReading::new(sensor_type, value, timestamp, device_id.map(str::to_owned))
            })
        })
        .collect()
}

/// Convert an IEEE-11073 16-bit SFLOAT, None for the reserved special values
pub fn sfloat_to_f64(raw: u16) -> Option<f64> {
    // NaN, NRes, +INF, -INF, reserved
    if matches!(raw, 0x07FF | 0x0800 | 0x07FE | 0x0802 | 0x0801) {
        return None;
    }
    let mantissa = (((raw & 0x0FFF) << 4) as i16) >> 4;
    let exponent = ((raw >> 12) as i8) << 4 >> 4;
    Some(mantissa as f64 * 10f64.powi(exponent as i32))
}

/// Convert an IEEE-11073 32-bit FLOAT, None for the reserved special values
pub fn float_to_f64(raw: u32) -> Option<f64> {
    if matches!(
        raw,
        0x007F_FFFF | 0x0080_0000 | 0x007F_FFFE | 0x0080_0002 | 0x0080_0001
    ) {
        return None;
    }
    let mantissa = (((raw & 0x00FF_FFFF) << 8) as i32) >> 8;
    let exponent = (raw >> 24) as i8;
    Some(mantissa as f64 * 10f64.powi(exponent as i32))
}

/// Decode a notification from `characteristic` for the given device type
///
/// Unknown characteristics decode to an empty set of readings.
pub fn decode(
    device_type: DeviceType,
    characteristic: Uuid,
    data: &[u8],
    timestamp: OffsetDateTime,
    device_id: Option<&str>,
) -> Vec<SensorReading> {
    if characteristic == BATTERY_LEVEL {
        return parse_battery_data(data, timestamp, device_id)
            .into_iter()
            .collect();
    }

    match device_type {
        DeviceType::AnrMuscleSense if characteristic == HEART_RATE_MEASUREMENT => {
            parse_emg_data(data, timestamp, device_id)
        }
        DeviceType::Oralable if characteristic == HEART_RATE_MEASUREMENT => {
            parse_heart_rate_data(data, timestamp, device_id)
                .into_iter()
                .collect()
        }
        DeviceType::Oralable if characteristic == TEMPERATURE_MEASUREMENT => {
            parse_temperature_data(data, timestamp, device_id)
                .into_iter()
                .collect()
        }
        DeviceType::Oralable if characteristic == PLX_CONTINUOUS_MEASUREMENT => {
            parse_spo2_data(data, timestamp, device_id)
        }
        _ => {
            debug!(
                "No decoder for characteristic {} on {}",
                characteristic, device_type
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn emg_eight_bit_value() {
        let readings = parse_emg_data(&[0x00, 0x05], base(), Some("anr-1"));
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor_type, SensorType::Emg);
        assert_eq!(readings[0].value, 5.0);
        assert_eq!(readings[0].timestamp, base());
        assert_eq!(readings[0].device_id.as_deref(), Some("anr-1"));
    }

    #[test]
    fn emg_every_single_byte_value() {
        for byte in 0..=u8::MAX {
            let readings = parse_emg_data(&[0x00, byte], base(), None);
            assert_eq!(readings.len(), 1);
            assert_eq!(readings[0].value, byte as f64);
        }
    }

    #[test]
    fn emg_sixteen_bit_value() {
        let readings = parse_emg_data(&[0x01, 0x64, 0x00], base(), None);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 100.0);

        let readings = parse_emg_data(&[0x01, 0x34, 0x12], base(), None);
        assert_eq!(readings[0].value, 0x1234 as f64);
    }

    #[test]
    fn emg_trailing_samples_are_spaced_ten_ms() {
        let data = [0x01, 0x10, 0x00, 0x20, 0x00, 0x30, 0x01];
        let readings = parse_emg_data(&data, base(), None);
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![16.0, 32.0, 304.0]);
        assert_eq!(readings[1].timestamp, base() + Duration::milliseconds(10));
        assert_eq!(readings[2].timestamp, base() + Duration::milliseconds(20));
    }

    #[test]
    fn emg_ignores_dangling_byte() {
        let readings = parse_emg_data(&[0x00, 0x07, 0x02, 0x00, 0xFF], base(), None);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].value, 2.0);
    }

    #[test]
    fn emg_short_buffers_decode_to_nothing() {
        assert!(parse_emg_data(&[], base(), None).is_empty());
        assert!(parse_emg_data(&[0x00], base(), None).is_empty());
        assert!(parse_emg_data(&[0x01, 0x64], base(), None).is_empty());
    }

    #[test]
    fn battery_is_single_byte_percentage() {
        let reading = parse_battery_data(&[87], base(), None).unwrap();
        assert_eq!(reading.sensor_type, SensorType::Battery);
        assert_eq!(reading.value, 87.0);
        assert!(parse_battery_data(&[], base(), None).is_none());
        // not range checked
        assert_eq!(parse_battery_data(&[255], base(), None).unwrap().value, 255.0);
    }

    #[test]
    fn heart_rate_with_rr_intervals_and_energy() {
        // u8 bpm, contact detected, energy expended, two RR intervals
        let data = [0x1E, 72, 0x10, 0x00, 0x00, 0x04, 0x10, 0x04];
        let reading = parse_heart_rate_data(&data, base(), None).unwrap();
        assert_eq!(reading.sensor_type, SensorType::HeartRate);
        assert_eq!(reading.value, 72.0);
        assert_eq!(reading.quality, Some(1.0));
    }

    #[test]
    fn heart_rate_contact_lost_has_zero_quality() {
        let reading = parse_heart_rate_data(&[0x04, 80], base(), None).unwrap();
        assert_eq!(reading.quality, Some(0.0));
    }

    #[test]
    fn heart_rate_without_quality_hints() {
        let reading = parse_heart_rate_data(&[0x01, 0x2C, 0x01], base(), None).unwrap();
        assert_eq!(reading.value, 300.0);
        assert_eq!(reading.quality, None);
        assert!(!reading.is_valid());
    }

    #[test]
    fn temperature_in_celsius_and_fahrenheit() {
        // 366 * 10^-1
        let celsius = [0x00, 0x6E, 0x01, 0x00, 0xFF];
        let reading = parse_temperature_data(&celsius, base(), None).unwrap();
        assert!((reading.value - 36.6).abs() < 1e-9);

        // 986 * 10^-1 °F = 37 °C
        let fahrenheit = [0x01, 0xDA, 0x03, 0x00, 0xFF];
        let reading = parse_temperature_data(&fahrenheit, base(), None).unwrap();
        assert!((reading.value - 37.0).abs() < 1e-9);

        assert!(parse_temperature_data(&[0x00, 0x6E, 0x01], base(), None).is_none());
        assert!(parse_temperature_data(&[0x00, 0xFF, 0xFF, 0x7F, 0x00], base(), None).is_none());
    }

    #[test]
    fn spo2_and_pulse_rate() {
        // SpO2 = 98, pulse = 64
        let data = [0x00, 0x62, 0x00, 0x40, 0x00];
        let readings = parse_spo2_data(&data, base(), None);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].sensor_type, SensorType::SpO2);
        assert_eq!(readings[0].value, 98.0);
        assert_eq!(readings[1].sensor_type, SensorType::HeartRate);
        assert_eq!(readings[1].value, 64.0);

        // pulse rate NaN
        let data = [0x00, 0x62, 0x00, 0xFF, 0x07];
        assert_eq!(parse_spo2_data(&data, base(), None).len(), 1);
    }

    #[test]
    fn sfloat_conversion() {
        assert_eq!(sfloat_to_f64(0x0062), Some(98.0));
        // mantissa -1, exponent -1
        assert_eq!(sfloat_to_f64(0xFFFF), Some(-0.1));
        assert_eq!(sfloat_to_f64(0x07FF), None);
        assert_eq!(sfloat_to_f64(0x0800), None);
        assert_eq!(sfloat_to_f64(0x07FE), None);
        assert_eq!(sfloat_to_f64(0x0802), None);
        assert_eq!(sfloat_to_f64(0x0801), None);
    }

    #[test]
    fn float_conversion() {
        // 3675 x 10^-2
        let celsius = float_to_f64(0xFE00_0E5B).unwrap();
        assert!((celsius - 36.75).abs() < 1e-9);
        // mantissa -1, exponent 0
        assert_eq!(float_to_f64(0x00FF_FFFF), Some(-1.0));
        assert_eq!(float_to_f64(0x0100_0005), Some(50.0));
        for special in [0x007F_FFFF, 0x0080_0000, 0x007F_FFFE, 0x0080_0002, 0x0080_0001] {
            assert_eq!(float_to_f64(special), None);
        }
    }

    #[test]
    fn decode_dispatches_by_device_type() {
        let data = [0x00, 0x05];
        let emg = decode(DeviceType::AnrMuscleSense, HEART_RATE_MEASUREMENT, &data, base(), None);
        assert_eq!(emg[0].sensor_type, SensorType::Emg);

        let hr = decode(DeviceType::Oralable, HEART_RATE_MEASUREMENT, &data, base(), None);
        assert_eq!(hr[0].sensor_type, SensorType::HeartRate);

        let battery = decode(DeviceType::AnrMuscleSense, BATTERY_LEVEL, &[50], base(), None);
        assert_eq!(battery[0].sensor_type, SensorType::Battery);

        assert!(decode(
            DeviceType::AnrMuscleSense,
            TEMPERATURE_MEASUREMENT,
            &data,
            base(),
            None
        )
        .is_empty());
    }
}
