//! Control point wire codec.
//!
//! Requests are small fixed layouts and cannot fail to encode. Responses come
//! from the device and are treated as untrusted: every read goes through
//! [`Reader`], which reports a short buffer as [`DecodeError::Truncated`]
//! instead of indexing past the end.

use serde::Serialize;

use crate::errors::DecodeError;
use crate::registry::{
    DeviceStatus, FeatureSupport, MeasurementType, Operation, SettingType, SettingValue,
    RESPONSE_FEATURE_READ, RESPONSE_MEASUREMENT_CONTROL, SETTING_LENGTH,
};

// ============================================================================
// Byte reader
// ============================================================================

/// Bounds-checked little-endian cursor over a notification payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16_le(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u64_le(&mut self) -> Result<u64, DecodeError> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(word))
    }

    /// Everything not yet consumed.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

// ============================================================================
// Requests
// ============================================================================

/// `[GET_SETTINGS, type]`
pub fn encode_get_settings(measurement: MeasurementType) -> Vec<u8> {
    vec![Operation::GetSettings.code(), measurement.code()]
}

/// `[START, type]` followed by `[setting, 1, lo, hi]` per setting, in the given order.
pub fn encode_start(measurement: MeasurementType, settings: &[(SettingType, u16)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + settings.len() * 4);
    out.push(Operation::Start.code());
    out.push(measurement.code());
    for &(setting, value) in settings {
        out.push(setting.code());
        out.push(SETTING_LENGTH);
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// `[STOP, type]`
pub fn encode_stop(measurement: MeasurementType) -> Vec<u8> {
    vec![Operation::Stop.code(), measurement.code()]
}

// ============================================================================
// Responses
// ============================================================================

/// One advertised setting and the values the sensor offers for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingParameter {
    pub setting: SettingType,
    pub values: Vec<SettingValue>,
}

impl SettingParameter {
    pub fn offers(&self, raw: u16) -> bool {
        self.values.iter().any(|v| v.raw == raw)
    }

    /// Value with the largest physical magnitude.
    pub fn highest(&self) -> Option<SettingValue> {
        self.values.iter().copied().max_by_key(|v| v.value)
    }
}

/// A decoded control point notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "response", rename_all = "camelCase")]
pub enum ControlPointResponse {
    FeatureRead(FeatureSupport),
    SettingsMap {
        measurement: MeasurementType,
        status: DeviceStatus,
        more_frames: bool,
        parameters: Vec<SettingParameter>,
    },
    StartAck {
        measurement: MeasurementType,
        status: DeviceStatus,
        more_frames: bool,
        parameters: Vec<SettingParameter>,
    },
    StopAck {
        measurement: MeasurementType,
        status: DeviceStatus,
    },
}

impl ControlPointResponse {
    /// Operation this response acknowledges, `None` for feature reads.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            ControlPointResponse::FeatureRead(_) => None,
            ControlPointResponse::SettingsMap { .. } => Some(Operation::GetSettings),
            ControlPointResponse::StartAck { .. } => Some(Operation::Start),
            ControlPointResponse::StopAck { .. } => Some(Operation::Stop),
        }
    }
}

/// Decode the bitmap of a feature read (`[0x0F, flags]`).
pub fn decode_feature_read(bytes: &[u8]) -> Result<FeatureSupport, DecodeError> {
    let mut r = Reader::new(bytes);
    let kind = r.u8()?;
    if kind != RESPONSE_FEATURE_READ {
        return Err(DecodeError::UnknownResponseType(kind));
    }
    Ok(FeatureSupport::from_flags(r.u8()?))
}

pub fn decode_control_point_response(bytes: &[u8]) -> Result<ControlPointResponse, DecodeError> {
    let mut r = Reader::new(bytes);
    match r.u8()? {
        RESPONSE_FEATURE_READ => Ok(ControlPointResponse::FeatureRead(
            FeatureSupport::from_flags(r.u8()?),
        )),
        RESPONSE_MEASUREMENT_CONTROL => decode_measurement_control(&mut r),
        other => Err(DecodeError::UnknownResponseType(other)),
    }
}

fn decode_measurement_control(r: &mut Reader<'_>) -> Result<ControlPointResponse, DecodeError> {
    let operation = Operation::from_code(r.u8()?)?;
    let measurement = MeasurementType::from_code(r.u8()?)?;
    let status = DeviceStatus::from_code(r.u8()?);

    if operation == Operation::Stop {
        return Ok(ControlPointResponse::StopAck {
            measurement,
            status,
        });
    }

    // Continuation flag; some firmware omits it.
    let more_frames = if r.is_empty() { false } else { r.u8()? != 0 };

    let parameters = match operation {
        Operation::Start if !status.is_success() || r.remaining() <= 1 => Vec::new(),
        Operation::GetSettings if !status.is_success() => Vec::new(),
        _ => decode_parameters(r)?,
    };

    Ok(match operation {
        Operation::Start => ControlPointResponse::StartAck {
            measurement,
            status,
            more_frames,
            parameters,
        },
        _ => ControlPointResponse::SettingsMap {
            measurement,
            status,
            more_frames,
            parameters,
        },
    })
}

fn decode_parameters(r: &mut Reader<'_>) -> Result<Vec<SettingParameter>, DecodeError> {
    let mut parameters = Vec::new();
    while !r.is_empty() {
        let setting = SettingType::from_code(r.u8()?)?;
        let count = r.u8()?;
        let mut values = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            values.push(setting.resolve(r.u16_le()?)?);
        }
        parameters.push(SettingParameter { setting, values });
    }
    Ok(parameters)
}
