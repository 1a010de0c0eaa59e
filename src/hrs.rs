//! Standard Heart Rate and Battery service payloads.
//!
//! Polar sensors expose these next to PMD. They are plain Bluetooth SIG
//! characteristics and need no negotiation.

use std::fmt;

use serde::Serialize;

use crate::codec::Reader;
use crate::errors::{CodeKind, DecodeError};

const FLAG_RATE_16_BITS: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SENSOR_PRESENT: u8 = 0x04;
const FLAG_ENERGY_PRESENT: u8 = 0x08;
const FLAG_RR_INTERVAL_PRESENT: u8 = 0x10;

/// Decoded Heart Rate Measurement (0x2A37) notification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateMeasurement {
    /// Beats per minute.
    pub heart_rate: u16,
    /// `None` when the sensor has no contact detection.
    pub contact_detected: Option<bool>,
    /// Kilojoules since the last reset.
    pub energy_expended: Option<u16>,
    /// RR intervals in 1/1024 s.
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    /// RR intervals in seconds.
    pub fn rr_seconds(&self) -> impl Iterator<Item = f64> + '_ {
        self.rr_intervals.iter().map(|rr| f64::from(*rr) / 1024.0)
    }
}

pub fn parse_heart_rate_measurement(bytes: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    let mut r = Reader::new(bytes);
    let flags = r.u8()?;

    let heart_rate = if flags & FLAG_RATE_16_BITS != 0 {
        r.u16_le()?
    } else {
        u16::from(r.u8()?)
    };

    let contact_detected =
        (flags & FLAG_CONTACT_SENSOR_PRESENT != 0).then_some(flags & FLAG_CONTACT_DETECTED != 0);

    let energy_expended = if flags & FLAG_ENERGY_PRESENT != 0 {
        Some(r.u16_le()?)
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flags & FLAG_RR_INTERVAL_PRESENT != 0 {
        // A trailing odd byte is ignored.
        while r.remaining() >= 2 {
            rr_intervals.push(r.u16_le()?);
        }
    }

    Ok(HeartRateMeasurement {
        heart_rate,
        contact_detected,
        energy_expended,
        rr_intervals,
    })
}

/// Body Sensor Location (0x2A38).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BodySensorLocation {
    Other,
    Chest,
    Wrist,
    Finger,
    Hand,
    EarLobe,
    Foot,
}

impl BodySensorLocation {
    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        Ok(match code {
            0 => BodySensorLocation::Other,
            1 => BodySensorLocation::Chest,
            2 => BodySensorLocation::Wrist,
            3 => BodySensorLocation::Finger,
            4 => BodySensorLocation::Hand,
            5 => BodySensorLocation::EarLobe,
            6 => BodySensorLocation::Foot,
            _ => {
                return Err(DecodeError::UnknownCode {
                    kind: CodeKind::BodySensorLocation,
                    code: code.into(),
                })
            }
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_code(Reader::new(bytes).u8()?)
    }
}

impl fmt::Display for BodySensorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BodySensorLocation::Other => "Other",
            BodySensorLocation::Chest => "Chest",
            BodySensorLocation::Wrist => "Wrist",
            BodySensorLocation::Finger => "Finger",
            BodySensorLocation::Hand => "Hand",
            BodySensorLocation::EarLobe => "Ear lobe",
            BodySensorLocation::Foot => "Foot",
        })
    }
}

/// Battery Level (0x2A19), percent.
pub fn parse_battery_level(bytes: &[u8]) -> Result<u8, DecodeError> {
    Reader::new(bytes).u8()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_8bit_rate_with_rr() {
        // contact sensor present + detected, RR present
        let hr = parse_heart_rate_measurement(&[0x16, 0x48, 0x00, 0x04, 0x10, 0x04]).unwrap();
        assert_eq!(
            hr,
            HeartRateMeasurement {
                heart_rate: 72,
                contact_detected: Some(true),
                energy_expended: None,
                rr_intervals: vec![1024, 1040],
            }
        );
        assert_eq!(hr.rr_seconds().next(), Some(1.0));
    }

    #[test]
    fn test_16bit_rate_and_energy() {
        let hr = parse_heart_rate_measurement(&[0x09, 0x2C, 0x01, 0x10, 0x00]).unwrap();
        assert_eq!(hr.heart_rate, 300);
        assert_eq!(hr.energy_expended, Some(16));
        assert_eq!(hr.contact_detected, None);
        assert!(hr.rr_intervals.is_empty());
    }

    #[test]
    fn test_contact_without_sensor_is_unknown() {
        let hr = parse_heart_rate_measurement(&[0x02, 0x3C]).unwrap();
        assert_eq!(hr.contact_detected, None);
        let hr = parse_heart_rate_measurement(&[0x04, 0x3C]).unwrap();
        assert_eq!(hr.contact_detected, Some(false));
    }

    #[test]
    fn test_odd_rr_tail_ignored() {
        let hr = parse_heart_rate_measurement(&[0x10, 0x3C, 0x00, 0x04, 0x01]).unwrap();
        assert_eq!(hr.rr_intervals, vec![1024]);
    }

    #[test]
    fn test_truncated() {
        assert!(parse_heart_rate_measurement(&[]).is_err());
        assert!(parse_heart_rate_measurement(&[0x01, 0x3C]).is_err());
        assert!(parse_heart_rate_measurement(&[0x08, 0x3C, 0x01]).is_err());
    }

    #[test]
    fn test_body_location_and_battery() {
        assert_eq!(BodySensorLocation::parse(&[0x01]).unwrap(), BodySensorLocation::Chest);
        assert_eq!(BodySensorLocation::EarLobe.to_string(), "Ear lobe");
        assert!(BodySensorLocation::from_code(7).is_err());
        assert_eq!(parse_battery_level(&[87]).unwrap(), 87);
        assert!(parse_battery_level(&[]).is_err());
    }
}
