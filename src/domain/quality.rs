//! In-ear positioning quality.
//!
//! Both firmware generations report a raw signal quality, but on different
//! scales. `normalize` maps either onto 0..=100 where 100 is good, 50..=99
//! medium and everything below 50 bad.

use crate::domain::models::FirmwareGeneration;

/// Upper bound of the normalized scale.
pub const MAX_QUALITY: u8 = 100;

pub fn normalize(raw: u8, firmware: FirmwareGeneration) -> u8 {
    let raw = raw as f64;
    match firmware {
        // New firmware: 30 and above is good, anything else is bad.
        FirmwareGeneration::New => {
            if raw >= 30.0 {
                MAX_QUALITY
            } else {
                (1.72 * raw) as u8
            }
        }
        // Old firmware reads 30..=50 for plausible signals too, so that range
        // gets its own medium band.
        FirmwareGeneration::Old => {
            if raw > 50.0 {
                MAX_QUALITY
            } else if raw >= 30.0 {
                50 + ((raw - 30.0) * 2.45) as u8
            } else {
                (1.66 * raw) as u8
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLabel {
    Good,
    Medium,
    Bad,
}

impl QualityLabel {
    pub fn from_normalized(quality: u8) -> Self {
        if quality >= MAX_QUALITY {
            Self::Good
        } else if quality >= 50 {
            Self::Medium
        } else {
            Self::Bad
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_firmware_curve() {
        assert_eq!(normalize(30, FirmwareGeneration::New), 100);
        assert_eq!(normalize(0, FirmwareGeneration::New), 0);
        assert_eq!(normalize(29, FirmwareGeneration::New), 49);
        assert_eq!(normalize(255, FirmwareGeneration::New), 100);
    }

    #[test]
    fn test_old_firmware_curve() {
        assert_eq!(normalize(51, FirmwareGeneration::Old), 100);
        assert_eq!(normalize(50, FirmwareGeneration::Old), 99);
        assert_eq!(normalize(30, FirmwareGeneration::Old), 50);
        assert_eq!(normalize(29, FirmwareGeneration::Old), 48);
    }

    #[test]
    fn test_monotonic_and_bounded() {
        for firmware in [FirmwareGeneration::Old, FirmwareGeneration::New] {
            let mut previous = 0u8;
            for raw in 0..=255u8 {
                let quality = normalize(raw, firmware);
                assert!(quality <= MAX_QUALITY, "{raw} -> {quality}");
                assert!(quality >= previous, "{firmware:?} drops at {raw}");
                previous = quality;
            }
        }
    }

    #[test]
    fn test_labels() {
        assert_eq!(QualityLabel::from_normalized(100), QualityLabel::Good);
        assert_eq!(QualityLabel::from_normalized(50), QualityLabel::Medium);
        assert_eq!(QualityLabel::from_normalized(49), QualityLabel::Bad);
    }
}
