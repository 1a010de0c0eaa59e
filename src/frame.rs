//! Data notification decoding.
//!
//! A PMD data notification is laid out as:
//!
//! ```text
//! [type: u8][timestamp: u64 LE][frame type: u8][body ...]
//! ```
//!
//! The timestamp is a sensor-local tick count and is passed through untouched.
//! How the body is read depends on the measurement type, the frame type and
//! the resolution negotiated when the stream was started.

use serde::Serialize;

use crate::codec::Reader;
use crate::errors::DecodeError;
use crate::registry::{AccFrameType, ActiveSettings, MeasurementType, ECG_FRAME_RES14};

/// Resolution assumed for ECG when none was negotiated.
pub const DEFAULT_ECG_RESOLUTION: u8 = 14;

const HEADER_LEN: usize = 10;
const ACC_CHANNELS: usize = 3;

/// Samples carried by one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Samples {
    /// One channel, normalized to [-1, 1].
    Single(Vec<f64>),
    /// x, y, z. RES8 and RES16 are scaled to [-1, 1), RES24 is the raw signed count.
    Triaxial(Vec<[f64; 3]>),
    /// Frame body with no decoded grammar.
    Raw(Vec<u8>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::Single(v) => v.len(),
            Samples::Triaxial(v) => v.len(),
            Samples::Raw(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into 1- or 3-tuples, the shape sinks consume.
    pub fn to_tuples(&self) -> Vec<Vec<f64>> {
        match self {
            Samples::Single(v) => v.iter().map(|s| vec![*s]).collect(),
            Samples::Triaxial(v) => v.iter().map(|s| s.to_vec()).collect(),
            Samples::Raw(v) => v.iter().map(|b| vec![f64::from(*b)]).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedFrame {
    pub measurement: MeasurementType,
    pub timestamp: u64,
    pub frame_type: u8,
    pub samples: Samples,
}

/// Sign-extend the low `bits` bits of `raw`.
///
/// Shifting left by `32 - bits` parks the sign bit of the field at bit 31, and
/// the arithmetic shift back copies it into every higher bit.
pub fn sign_extend(raw: u32, bits: u8) -> i32 {
    let shift = 32 - u32::from(bits.clamp(1, 32));
    ((raw << shift) as i32) >> shift
}

/// Scale a `bits`-wide signed value into [-1, 1).
pub fn normalize(value: i32, bits: u8) -> f64 {
    let bits = bits.clamp(1, 32);
    f64::from(value) / 2f64.powi(i32::from(bits) - 1)
}

/// Decode one data notification using the settings active for its stream.
pub fn decode_frame(payload: &[u8], settings: &ActiveSettings) -> Result<DecodedFrame, DecodeError> {
    let mut r = Reader::new(payload);
    let measurement = MeasurementType::from_code(r.u8()?)?;
    let timestamp = r.u64_le()?;
    let frame_type = r.u8()?;
    let body = r.rest();

    let samples = match measurement {
        MeasurementType::Ecg if frame_type == ECG_FRAME_RES14 => {
            let bits = settings.resolution().unwrap_or(DEFAULT_ECG_RESOLUTION);
            Samples::Single(decode_ecg(body, bits)?)
        }
        MeasurementType::Acceleration => match AccFrameType::from_code(frame_type) {
            Some(AccFrameType::Res8) => Samples::Triaxial(decode_acc(body, 1)?),
            Some(AccFrameType::Res16) => Samples::Triaxial(decode_acc(body, 2)?),
            Some(AccFrameType::Res24) => Samples::Triaxial(decode_acc(body, 3)?),
            Some(AccFrameType::Delta) | None => {
                return Err(DecodeError::UnsupportedFrameType {
                    measurement,
                    frame_type,
                })
            }
        },
        MeasurementType::Ppg => Samples::Raw(body.to_vec()),
        _ => {
            return Err(DecodeError::UnsupportedFrameType {
                measurement,
                frame_type,
            })
        }
    };

    Ok(DecodedFrame {
        measurement,
        timestamp,
        frame_type,
        samples,
    })
}

fn check_groups(body: &[u8], group: usize) -> Result<(), DecodeError> {
    let tail = body.len() % group;
    if tail != 0 {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN + body.len() + (group - tail),
            available: HEADER_LEN + body.len(),
        });
    }
    Ok(())
}

fn decode_ecg(body: &[u8], bits: u8) -> Result<Vec<f64>, DecodeError> {
    check_groups(body, 3)?;
    Ok(body
        .chunks_exact(3)
        .map(|c| {
            let raw = u32::from(c[0]) | u32::from(c[1]) << 8 | u32::from(c[2]) << 16;
            normalize(sign_extend(raw, bits), bits)
        })
        .collect())
}

fn decode_acc(body: &[u8], width: usize) -> Result<Vec<[f64; 3]>, DecodeError> {
    check_groups(body, width * ACC_CHANNELS)?;
    Ok(body
        .chunks_exact(width * ACC_CHANNELS)
        .map(|sample| {
            let mut xyz = [0.0; 3];
            for (axis, c) in xyz.iter_mut().zip(sample.chunks_exact(width)) {
                *axis = match width {
                    1 => f64::from(c[0] as i8) / 128.0,
                    2 => f64::from(i16::from_le_bytes([c[0], c[1]])) / 32768.0,
                    _ => f64::from(i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8),
                };
            }
            xyz
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SettingType;
    use pretty_assertions::assert_eq;

    fn payload(measurement: u8, timestamp: u64, frame_type: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![measurement];
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.push(frame_type);
        out.extend_from_slice(body);
        out
    }

    fn with_resolution(bits: u16) -> ActiveSettings {
        ActiveSettings::resolve(&[(SettingType::Resolution, bits)]).unwrap()
    }

    /// Encode a signed value as the 3 bytes a sensor would send.
    fn encode_24(value: i32) -> [u8; 3] {
        let b = value.to_le_bytes();
        [b[0], b[1], b[2]]
    }

    #[test]
    fn test_sign_extend_boundaries() {
        for bits in [14u8, 16, 22] {
            let max = (1i32 << (bits - 1)) - 1;
            let min = -(1i32 << (bits - 1));
            let mask = (1u32 << bits) - 1;
            for value in [max, min, 0, -1, 1] {
                assert_eq!(sign_extend(value as u32 & mask, bits), value, "{bits} bits");
            }
        }
        // Bits above the field are ignored.
        assert_eq!(sign_extend(0x00FF_E000, 14), -8192);
    }

    #[test]
    fn test_ecg_max_positive() {
        let frame = decode_frame(&payload(0x00, 7, 0x00, &[0xFF, 0x1F, 0x00]), &with_resolution(14))
            .unwrap();
        assert_eq!(frame.measurement, MeasurementType::Ecg);
        assert_eq!(frame.timestamp, 7);
        assert_eq!(frame.samples, Samples::Single(vec![8191.0 / 8192.0]));
    }

    #[test]
    fn test_ecg_boundaries_per_resolution() {
        for bits in [14u16, 16, 22] {
            let max = (1i32 << (bits - 1)) - 1;
            let min = -(1i32 << (bits - 1));
            let mut body = Vec::new();
            body.extend_from_slice(&encode_24(max));
            body.extend_from_slice(&encode_24(min));
            let frame = decode_frame(&payload(0x00, 0, 0x00, &body), &with_resolution(bits)).unwrap();
            let scale = f64::from(1u32 << (bits - 1));
            assert_eq!(
                frame.samples,
                Samples::Single(vec![f64::from(max) / scale, -1.0])
            );
        }
    }

    #[test]
    fn test_ecg_default_resolution() {
        let frame =
            decode_frame(&payload(0x00, 0, 0x00, &[0x00, 0x20, 0x00]), &ActiveSettings::default())
                .unwrap();
        assert_eq!(frame.samples, Samples::Single(vec![-1.0]));
    }

    #[test]
    fn test_acc_res16() {
        let body = [0x00, 0x80, 0x00, 0x00, 0xFF, 0x7F];
        let frame = decode_frame(&payload(0x02, 1, 0x01, &body), &ActiveSettings::default()).unwrap();
        assert_eq!(
            frame.samples,
            Samples::Triaxial(vec![[-1.0, 0.0, 32767.0 / 32768.0]])
        );
        assert_eq!(frame.samples.to_tuples(), vec![vec![-1.0, 0.0, 32767.0 / 32768.0]]);
    }

    #[test]
    fn test_acc_res8_and_res24() {
        let frame = decode_frame(
            &payload(0x02, 0, 0x00, &[0x80, 0x40, 0x00, 0x7F, 0xC0, 0x01]),
            &ActiveSettings::default(),
        )
        .unwrap();
        assert_eq!(
            frame.samples,
            Samples::Triaxial(vec![
                [-1.0, 0.5, 0.0],
                [127.0 / 128.0, -0.5, 1.0 / 128.0]
            ])
        );

        // RES24 is the sign-extended integer, unscaled.
        let body = [
            0x00, 0x00, 0x80, 0xFF, 0xFF, 0x7F, 0x00, 0x00, 0x40, // sample 1
            0xFF, 0xFF, 0x7F, 0x00, 0x00, 0x80, 0x01, 0x00, 0x00, // sample 2
        ];
        let frame = decode_frame(&payload(0x02, 0, 0x02, &body), &ActiveSettings::default()).unwrap();
        assert_eq!(
            frame.samples,
            Samples::Triaxial(vec![
                [-8_388_608.0, 8_388_607.0, 4_194_304.0],
                [8_388_607.0, -8_388_608.0, 1.0]
            ])
        );
    }

    #[test]
    fn test_unsupported_frames() {
        let settings = ActiveSettings::default();
        assert_eq!(
            decode_frame(&payload(0x02, 0, 0x80, &[0; 6]), &settings),
            Err(DecodeError::UnsupportedFrameType {
                measurement: MeasurementType::Acceleration,
                frame_type: 0x80
            })
        );
        assert_eq!(
            decode_frame(&payload(0x00, 0, 0x01, &[0; 3]), &settings),
            Err(DecodeError::UnsupportedFrameType {
                measurement: MeasurementType::Ecg,
                frame_type: 0x01
            })
        );
        assert!(matches!(
            decode_frame(&payload(0x05, 0, 0x00, &[0; 6]), &settings),
            Err(DecodeError::UnsupportedFrameType { .. })
        ));
    }

    #[test]
    fn test_ppg_is_raw() {
        let frame = decode_frame(&payload(0x01, 3, 0x00, &[1, 2, 3]), &ActiveSettings::default())
            .unwrap();
        assert_eq!(frame.samples, Samples::Raw(vec![1, 2, 3]));
    }

    #[test]
    fn test_short_payloads() {
        let settings = ActiveSettings::default();
        assert!(matches!(
            decode_frame(&[0x00, 0x01, 0x02], &settings),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(
            decode_frame(&payload(0x00, 0, 0x00, &[0xFF, 0x1F]), &settings),
            Err(DecodeError::Truncated {
                needed: 13,
                available: 12
            })
        );
        assert!(decode_frame(&[], &settings).is_err());
    }
}
