//! Ear Sensor Protocol
//!
//! GATT identifiers and payload decoders for the in-ear biosensor. Standard
//! Bluetooth SIG characteristics carry heart rate, temperature and battery;
//! two vendor characteristics carry raw data and the signal quality.

use crate::domain::models::{
    FirmwareGeneration, HeartMeasurement, NEW_FIRMWARE_NAME, OLD_FIRMWARE_NAME,
};
use tracing::trace;
use uuid::Uuid;

/// Heart Rate Measurement (0x2A37)
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
/// Body Sensor Location (0x2A38)
pub const BODY_SENSOR_LOCATION: Uuid = Uuid::from_u128(0x00002a38_0000_1000_8000_00805f9b34fb);
/// Temperature Measurement (0x2A1C)
pub const TEMPERATURE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a1c_0000_1000_8000_00805f9b34fb);
/// Battery Level (0x2A19)
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
/// Vendor raw data stream
pub const RAW_DATA: Uuid = Uuid::from_u128(0x0000a001_1212_efde_1523_785feabcd123);
/// Vendor signal (positioning) quality
pub const SIGNAL_QUALITY: Uuid = Uuid::from_u128(0x0000a002_1212_efde_1523_785feabcd123);

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// Characteristics we subscribe to after service discovery.
pub const RELEVANT_CHARACTERISTICS: [Uuid; 6] = [
    HEART_RATE_MEASUREMENT,
    BODY_SENSOR_LOCATION,
    TEMPERATURE_MEASUREMENT,
    BATTERY_LEVEL,
    RAW_DATA,
    SIGNAL_QUALITY,
];

/// Advertised names accepted by the scan filter.
pub const DEVICE_NAME_FILTER: [&str; 2] = [OLD_FIRMWARE_NAME, NEW_FIRMWARE_NAME];

/// New firmware prefixes valid quality frames with this marker.
const QUALITY_FRAME_MARKER: u8 = 0x06;
/// Offset of the quality value inside a new-firmware frame.
const QUALITY_FRAME_OFFSET: usize = 8;

/// Heart rate flag bits
mod hr_flags {
    pub const BPM_UINT16: u8 = 1 << 0;
    pub const ENERGY_EXPENDED: u8 = 1 << 3;
    pub const RR_INTERVALS: u8 = 1 << 4;
}

/// RR intervals are transmitted in 1/1024 s ticks.
const RR_TICKS_PER_SECOND: f32 = 1024.0;

pub fn is_relevant_characteristic(uuid: &Uuid) -> bool {
    RELEVANT_CHARACTERISTICS.contains(uuid)
}

/// A decoded characteristic value.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorReading {
    HeartRate(HeartMeasurement),
    Temperature(f32),
    /// Raw, firmware-dependent signal quality.
    Quality(u8),
    Battery(u8),
}

/// Decode a characteristic value by its UUID.
///
/// Returns `None` for characteristics that carry nothing we record, for
/// invalid quality frames and for payloads too short to hold the mandatory
/// fields.
pub fn decode(uuid: &Uuid, value: &[u8], firmware: FirmwareGeneration) -> Option<SensorReading> {
    trace!("Raw value {}: {:02X?}", uuid, value);
    match *uuid {
        HEART_RATE_MEASUREMENT => decode_heart_rate(value).map(SensorReading::HeartRate),
        TEMPERATURE_MEASUREMENT => decode_temperature(value).map(SensorReading::Temperature),
        SIGNAL_QUALITY => decode_raw_quality(value, firmware).map(SensorReading::Quality),
        BATTERY_LEVEL => decode_battery_level(value).map(SensorReading::Battery),
        _ => None,
    }
}

/// Parse a Heart Rate Measurement value
///
/// ```text
/// [0]     : Flags
///           bit 0: bpm is uint16 (else uint8)
///           bit 3: energy expended present (uint16, skipped)
///           bit 4: RR intervals present
/// [1..]   : bpm (1 or 2 bytes little-endian)
/// [..]    : energy expended (2 bytes, optional)
/// [..]    : RR intervals, uint16 little-endian each, 1/1024 s
/// ```
///
/// A dangling odd byte at the end of the RR list is ignored.
pub fn decode_heart_rate(bytes: &[u8]) -> Option<HeartMeasurement> {
    let flags = *bytes.first()?;
    let mut pos = 1;

    let bpm = if flags & hr_flags::BPM_UINT16 != 0 {
        let bpm = u16::from_le_bytes([*bytes.get(pos)?, *bytes.get(pos + 1)?]);
        pos += 2;
        bpm
    } else {
        let bpm = *bytes.get(pos)? as u16;
        pos += 1;
        bpm
    };

    if flags & hr_flags::ENERGY_EXPENDED != 0 {
        pos += 2;
    }

    let mut rr_intervals = Vec::new();
    if flags & hr_flags::RR_INTERVALS != 0 {
        while pos + 1 < bytes.len() {
            let raw = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            rr_intervals.push(raw as f32 / RR_TICKS_PER_SECOND);
            pos += 2;
        }
    }

    Some(HeartMeasurement { bpm, rr_intervals })
}

/// Parse a Temperature Measurement value
///
/// ```text
/// [0]     : Flags (always Celsius + type present for this sensor)
/// [1-4]   : Temperature, IEEE 11073-20601 FLOAT, little-endian
/// [5]     : Temperature type (ear)
/// ```
pub fn decode_temperature(bytes: &[u8]) -> Option<f32> {
    let raw: [u8; 4] = bytes.get(1..5)?.try_into().ok()?;
    Some(decode_ieee11073_float(raw))
}

/// Decode a 32-bit IEEE 11073-20601 FLOAT.
///
/// Bytes 0..3 hold a 24-bit two's-complement mantissa, byte 3 a signed
/// base-10 exponent. NaN, NRes, +/-INFINITY and the reserved value decode to
/// -1.0 because records are JSON, which has no representation for them.
pub fn decode_ieee11073_float(bytes: [u8; 4]) -> f32 {
    const NAN: i32 = 0x007F_FFFF;
    const NRES: i32 = -0x0080_0000;
    const POSITIVE_INFINITY: i32 = 0x007F_FFFE;
    const NEGATIVE_INFINITY: i32 = -0x007F_FFFE;
    const RESERVED: i32 = -0x007F_FFFF;

    let mantissa = ((bytes[2] as i8 as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[0] as i32;
    let exponent = bytes[3] as i8 as i32;

    if exponent == 0
        && matches!(
            mantissa,
            NAN | NRES | POSITIVE_INFINITY | NEGATIVE_INFINITY | RESERVED
        )
    {
        return -1.0;
    }

    (mantissa as f64 * 10f64.powi(exponent)) as f32
}

/// Extract the raw signal quality.
///
/// Old firmware sends the value in byte 0. New firmware multiplexes several
/// frame kinds; only frames starting with the quality marker are valid and
/// carry the value at byte 8. Other frames yield `None` and are dropped.
pub fn decode_raw_quality(bytes: &[u8], firmware: FirmwareGeneration) -> Option<u8> {
    match firmware {
        FirmwareGeneration::New => {
            if *bytes.first()? != QUALITY_FRAME_MARKER {
                trace!("Ignoring quality frame with marker {:#04X}", bytes[0]);
                return None;
            }
            bytes.get(QUALITY_FRAME_OFFSET).copied()
        }
        FirmwareGeneration::Old => bytes.first().copied(),
    }
}

/// Battery level in percent.
pub fn decode_battery_level(bytes: &[u8]) -> Option<u8> {
    bytes.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heart_rate_uint8_without_rr() {
        let hrm = decode_heart_rate(&[0x10, 0x4B]).unwrap();
        assert_eq!(hrm.bpm, 75);
        assert!(hrm.rr_intervals.is_empty());
    }

    #[test]
    fn test_heart_rate_single_rr() {
        let hrm = decode_heart_rate(&[0x10, 0x4B, 0x00, 0x02]).unwrap();
        assert_eq!(hrm.bpm, 75);
        assert_eq!(hrm.rr_intervals, vec![0.5]);
    }

    #[test]
    fn test_heart_rate_uint16_energy_and_rr() {
        // bpm 0x0104 = 260, energy 0xFFFF skipped, RR 1024 and 512
        let bytes = [0x19, 0x04, 0x01, 0xFF, 0xFF, 0x00, 0x04, 0x00, 0x02];
        let hrm = decode_heart_rate(&bytes).unwrap();
        assert_eq!(hrm.bpm, 260);
        assert_eq!(hrm.rr_intervals, vec![1.0, 0.5]);
    }

    #[test]
    fn test_heart_rate_rr_flag_clear_ignores_trailing_bytes() {
        let hrm = decode_heart_rate(&[0x00, 0x3C, 0x00, 0x02]).unwrap();
        assert_eq!(hrm.bpm, 60);
        assert!(hrm.rr_intervals.is_empty());
    }

    #[test]
    fn test_heart_rate_ragged_tail_is_ignored() {
        let hrm = decode_heart_rate(&[0x10, 0x4B, 0x00, 0x02, 0x07]).unwrap();
        assert_eq!(hrm.rr_intervals, vec![0.5]);
    }

    #[test]
    fn test_heart_rate_short_payload() {
        assert_eq!(decode_heart_rate(&[]), None);
        assert_eq!(decode_heart_rate(&[0x01, 0x4B]), None);
    }

    #[test]
    fn test_temperature_decoding() {
        // 365 * 10^-1
        let value = decode_temperature(&[0x04, 0x6D, 0x01, 0x00, 0xFF, 0x03]).unwrap();
        assert!((value - 36.5).abs() < 1e-4);
    }

    #[test]
    fn test_ieee11073_negative_mantissa() {
        // -5 * 10^0
        assert_eq!(decode_ieee11073_float([0xFB, 0xFF, 0xFF, 0x00]), -5.0);
        // 12 * 10^2
        assert_eq!(decode_ieee11073_float([0x0C, 0x00, 0x00, 0x02]), 1200.0);
    }

    #[test]
    fn test_ieee11073_special_values() {
        assert_eq!(decode_ieee11073_float([0xFF, 0xFF, 0x7F, 0x00]), -1.0); // NaN
        assert_eq!(decode_ieee11073_float([0x00, 0x00, 0x80, 0x00]), -1.0); // NRes
        assert_eq!(decode_ieee11073_float([0xFE, 0xFF, 0x7F, 0x00]), -1.0); // +INF
        assert_eq!(decode_ieee11073_float([0x02, 0x00, 0x80, 0x00]), -1.0); // -INF
    }

    #[test]
    fn test_raw_quality_new_firmware() {
        let mut frame = [0u8; 10];
        frame[0] = 0x06;
        frame[8] = 42;
        assert_eq!(decode_raw_quality(&frame, FirmwareGeneration::New), Some(42));

        frame[0] = 0x05;
        assert_eq!(decode_raw_quality(&frame, FirmwareGeneration::New), None);
    }

    #[test]
    fn test_raw_quality_old_firmware() {
        assert_eq!(decode_raw_quality(&[55, 1, 2], FirmwareGeneration::Old), Some(55));
        // byte 0 == marker is just a value for old firmware
        assert_eq!(decode_raw_quality(&[0x06], FirmwareGeneration::Old), Some(6));
    }

    #[test]
    fn test_decode_by_uuid() {
        assert_eq!(
            decode(&BATTERY_LEVEL, &[87], FirmwareGeneration::Old),
            Some(SensorReading::Battery(87))
        );
        assert_eq!(decode(&RAW_DATA, &[1, 2, 3], FirmwareGeneration::Old), None);
        assert!(is_relevant_characteristic(&BODY_SENSOR_LOCATION));
        assert!(!is_relevant_characteristic(&CLIENT_CHARACTERISTIC_CONFIG));
    }

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            HEART_RATE_MEASUREMENT.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            SIGNAL_QUALITY.to_string(),
            "0000a002-1212-efde-1523-785feabcd123"
        );
    }
}
