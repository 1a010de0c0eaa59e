//! Static code tables of the Polar Measurement Data protocol.
//!
//! Everything the wire codec and the negotiator need to turn numeric codes
//! into typed values lives here: measurement types, setting types and their
//! documented values, control point op codes, device status codes and frame
//! types. Lookups are total over the documented codes and fail with
//! [`DecodeError::UnknownCode`] for anything else; nothing is coerced.
//!
//! Adding support for a new sample rate, range or measurement type means
//! adding a table entry here, not touching the codec or the decoders.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::errors::{CodeKind, DecodeError};

// ============================================================================
// GATT identifiers
// ============================================================================

/// Polar Measurement Data service.
pub const PMD_SERVICE_UUID: Uuid = Uuid::from_u128(0xfb005c80_02e7_f387_1cad_8acd2d8df0c8);

/// PMD control point: requests are written here, responses arrive as notifications.
pub const PMD_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0xfb005c81_02e7_f387_1cad_8acd2d8df0c8);

/// PMD data characteristic (notifications carry measurement frames).
pub const PMD_DATA_UUID: Uuid = Uuid::from_u128(0xfb005c82_02e7_f387_1cad_8acd2d8df0c8);

pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const BODY_SENSOR_LOCATION_UUID: Uuid =
    Uuid::from_u128(0x00002a38_0000_1000_8000_00805f9b34fb);
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Bluetooth SIG company identifiers used by Polar in advertisement data.
pub const POLAR_MANUFACTURER_IDS: [u16; 2] = [0x006B, 0x00D1];

// ============================================================================
// Control point constants
// ============================================================================

pub const OP_GET_MEASUREMENT_SETTINGS: u8 = 0x01;
pub const OP_START_MEASUREMENT: u8 = 0x02;
pub const OP_STOP_MEASUREMENT: u8 = 0x03;

/// First byte of a feature read response.
pub const RESPONSE_FEATURE_READ: u8 = 0x0F;
/// First byte of a measurement control response.
pub const RESPONSE_MEASUREMENT_CONTROL: u8 = 0xF0;

/// Length byte written after each setting type in a START request.
///
/// The device reads it as a count of 16-bit values, so it is always 1 here.
pub const SETTING_LENGTH: u8 = 0x01;

/// Control point operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    GetSettings,
    Start,
    Stop,
}

impl Operation {
    pub fn code(self) -> u8 {
        match self {
            Operation::GetSettings => OP_GET_MEASUREMENT_SETTINGS,
            Operation::Start => OP_START_MEASUREMENT,
            Operation::Stop => OP_STOP_MEASUREMENT,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            OP_GET_MEASUREMENT_SETTINGS => Ok(Operation::GetSettings),
            OP_START_MEASUREMENT => Ok(Operation::Start),
            OP_STOP_MEASUREMENT => Ok(Operation::Stop),
            _ => Err(DecodeError::UnknownCode {
                kind: CodeKind::OpCode,
                code: code.into(),
            }),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::GetSettings => "get settings",
            Operation::Start => "start",
            Operation::Stop => "stop",
        })
    }
}

// ============================================================================
// Measurement types
// ============================================================================

/// Kind of stream a PMD sensor can produce.
///
/// Code 4 and 7..=255 are reserved by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MeasurementType {
    /// Volt (V)
    Ecg,
    Ppg,
    /// Force per unit mass (g)
    Acceleration,
    /// Second (s)
    PpInterval,
    /// Degrees per second (dps)
    Gyroscope,
    /// Gauss (G)
    Magnetometer,
}

impl MeasurementType {
    pub const ALL: [MeasurementType; 6] = [
        MeasurementType::Ecg,
        MeasurementType::Ppg,
        MeasurementType::Acceleration,
        MeasurementType::PpInterval,
        MeasurementType::Gyroscope,
        MeasurementType::Magnetometer,
    ];

    pub fn code(self) -> u8 {
        match self {
            MeasurementType::Ecg => 0x00,
            MeasurementType::Ppg => 0x01,
            MeasurementType::Acceleration => 0x02,
            MeasurementType::PpInterval => 0x03,
            MeasurementType::Gyroscope => 0x05,
            MeasurementType::Magnetometer => 0x06,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        Self::ALL
            .into_iter()
            .find(|m| m.code() == code)
            .ok_or(DecodeError::UnknownCode {
                kind: CodeKind::MeasurementType,
                code: code.into(),
            })
    }

    /// Bit in the feature read bitmap announcing support for this type.
    pub fn feature_flag(self) -> u8 {
        match self {
            MeasurementType::Ecg => 0x01,
            MeasurementType::Ppg => 0x02,
            MeasurementType::Acceleration => 0x04,
            MeasurementType::PpInterval => 0x08,
            MeasurementType::Gyroscope => 0x10,
            MeasurementType::Magnetometer => 0x20,
        }
    }

    /// Name handed to sample sinks.
    pub fn name(self) -> &'static str {
        match self {
            MeasurementType::Ecg => "ecg",
            MeasurementType::Ppg => "ppg",
            MeasurementType::Acceleration => "acceleration",
            MeasurementType::PpInterval => "ppInterval",
            MeasurementType::Gyroscope => "gyroscope",
            MeasurementType::Magnetometer => "magnetometer",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            MeasurementType::Ecg => "V",
            MeasurementType::Ppg => "",
            MeasurementType::Acceleration => "g",
            MeasurementType::PpInterval => "s",
            MeasurementType::Gyroscope => "dps",
            MeasurementType::Magnetometer => "G",
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MeasurementType {
    type Err = String;

    /// Accepts the sink name (`"ppInterval"`), any casing, or the short aliases `acc`, `ppi`, `gyro`, `mag`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let found = match lower.as_str() {
            "acc" => Some(MeasurementType::Acceleration),
            "ppi" => Some(MeasurementType::PpInterval),
            "gyro" => Some(MeasurementType::Gyroscope),
            "mag" => Some(MeasurementType::Magnetometer),
            _ => Self::ALL
                .into_iter()
                .find(|m| m.name().eq_ignore_ascii_case(&lower)),
        };
        found.ok_or_else(|| format!("unknown measurement type '{s}'"))
    }
}

/// Measurement types announced by a feature read response.
///
/// Fixed for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FeatureSupport {
    flags: u8,
}

impl FeatureSupport {
    pub fn from_flags(flags: u8) -> Self {
        Self { flags }
    }

    pub fn flags(self) -> u8 {
        self.flags
    }

    pub fn supports(self, measurement: MeasurementType) -> bool {
        self.flags & measurement.feature_flag() != 0
    }

    /// Supported types in protocol code order.
    pub fn supported(self) -> impl Iterator<Item = MeasurementType> {
        MeasurementType::ALL
            .into_iter()
            .filter(move |m| self.supports(*m))
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Negotiable stream parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    SampleRate,
    Resolution,
    Range,
    Channels,
}

// raw wire value (little-endian u16) -> physical value
const SAMPLE_RATES: &[(u16, u16)] = &[
    (0x0019, 25),
    (0x0032, 50),
    (0x0034, 52),
    (0x0064, 100),
    (0x0082, 130),
    (0x00C8, 200),
];
const RESOLUTIONS: &[(u16, u16)] = &[(0x000E, 14), (0x0010, 16), (0x0016, 22)];
const RANGES: &[(u16, u16)] = &[(0x0002, 2), (0x0004, 4), (0x0008, 8)];
const CHANNELS: &[(u16, u16)] = &[(0x0003, 3)];

impl SettingType {
    pub const ALL: [SettingType; 4] = [
        SettingType::SampleRate,
        SettingType::Resolution,
        SettingType::Range,
        SettingType::Channels,
    ];

    pub fn code(self) -> u8 {
        match self {
            SettingType::SampleRate => 0x00,
            SettingType::Resolution => 0x01,
            SettingType::Range => 0x02,
            SettingType::Channels => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or(DecodeError::UnknownCode {
                kind: CodeKind::SettingType,
                code: code.into(),
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            SettingType::SampleRate => "samplerate",
            SettingType::Resolution => "resolution",
            SettingType::Range => "range",
            SettingType::Channels => "channels",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SettingType::SampleRate => "Hz",
            SettingType::Resolution => "bits",
            SettingType::Range => "G",
            SettingType::Channels => "",
        }
    }

    fn table(self) -> &'static [(u16, u16)] {
        match self {
            SettingType::SampleRate => SAMPLE_RATES,
            SettingType::Resolution => RESOLUTIONS,
            SettingType::Range => RANGES,
            SettingType::Channels => CHANNELS,
        }
    }

    /// Every documented value of this setting.
    pub fn values(self) -> impl Iterator<Item = SettingValue> {
        self.table().iter().map(move |&(raw, value)| SettingValue {
            setting: self,
            raw,
            value,
        })
    }

    /// Resolve a raw wire code to its physical value.
    pub fn resolve(self, raw: u16) -> Result<SettingValue, DecodeError> {
        self.table()
            .iter()
            .find(|(code, _)| *code == raw)
            .map(|&(raw, value)| SettingValue {
                setting: self,
                raw,
                value,
            })
            .ok_or(DecodeError::UnknownCode {
                kind: CodeKind::SettingValue(self),
                code: raw,
            })
    }

    /// Find the raw code for a physical value (e.g. 130 Hz).
    pub fn encode(self, value: u16) -> Option<u16> {
        self.table()
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(raw, _)| *raw)
    }
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SettingType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "samplerate" | "sample_rate" | "rate" => Ok(SettingType::SampleRate),
            "resolution" | "res" => Ok(SettingType::Resolution),
            "range" => Ok(SettingType::Range),
            "channels" => Ok(SettingType::Channels),
            _ => Err(format!("unknown setting type '{s}'")),
        }
    }
}

/// A documented setting value, keeping the raw code for later selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettingValue {
    pub setting: SettingType,
    pub raw: u16,
    pub value: u16,
}

impl SettingValue {
    /// Two bytes as they appear on the wire.
    pub fn wire_bytes(self) -> [u8; 2] {
        self.raw.to_le_bytes()
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = self.setting.unit();
        if unit.is_empty() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, unit)
        }
    }
}

/// Settings in effect for a running stream, keyed by setting type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ActiveSettings(BTreeMap<SettingType, u16>);

impl ActiveSettings {
    /// Resolve a list of `(setting, raw code)` pairs.
    pub fn resolve(requested: &[(SettingType, u16)]) -> Result<Self, DecodeError> {
        let mut map = BTreeMap::new();
        for &(setting, raw) in requested {
            let resolved = setting.resolve(raw)?;
            map.insert(setting, resolved.value);
        }
        Ok(Self(map))
    }

    pub fn get(&self, setting: SettingType) -> Option<u16> {
        self.0.get(&setting).copied()
    }

    pub fn sample_rate(&self) -> Option<u16> {
        self.get(SettingType::SampleRate)
    }

    /// Bits per sample, if negotiated.
    pub fn resolution(&self) -> Option<u8> {
        self.get(SettingType::Resolution)
            .and_then(|r| u8::try_from(r).ok())
    }

    pub fn range(&self) -> Option<u16> {
        self.get(SettingType::Range)
    }

    pub fn channels(&self) -> Option<u16> {
        self.get(SettingType::Channels)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingType, u16)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Device status
// ============================================================================

/// Status byte of a measurement control response.
///
/// 0 is success, 1..=13 are documented errors, 14..=255 are reserved and kept raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceStatus {
    Success,
    InvalidOpCode,
    InvalidMeasurementType,
    NotSupported,
    InvalidLength,
    InvalidParameter,
    AlreadyInState,
    InvalidResolution,
    InvalidSampleRate,
    InvalidRange,
    InvalidMtu,
    InvalidNumberOfChannels,
    InvalidState,
    DeviceInCharger,
    Unknown(u8),
}

impl DeviceStatus {
    const TABLE: [DeviceStatus; 14] = [
        DeviceStatus::Success,
        DeviceStatus::InvalidOpCode,
        DeviceStatus::InvalidMeasurementType,
        DeviceStatus::NotSupported,
        DeviceStatus::InvalidLength,
        DeviceStatus::InvalidParameter,
        DeviceStatus::AlreadyInState,
        DeviceStatus::InvalidResolution,
        DeviceStatus::InvalidSampleRate,
        DeviceStatus::InvalidRange,
        DeviceStatus::InvalidMtu,
        DeviceStatus::InvalidNumberOfChannels,
        DeviceStatus::InvalidState,
        DeviceStatus::DeviceInCharger,
    ];

    pub fn from_code(code: u8) -> Self {
        Self::TABLE
            .get(usize::from(code))
            .copied()
            .unwrap_or(DeviceStatus::Unknown(code))
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceStatus::Unknown(code) => code,
            known => Self::TABLE
                .iter()
                .position(|s| *s == known)
                .and_then(|p| u8::try_from(p).ok())
                .unwrap_or(u8::MAX),
        }
    }

    pub fn is_success(self) -> bool {
        self == DeviceStatus::Success
    }

    pub fn message(self) -> &'static str {
        match self {
            DeviceStatus::Success => "SUCCESS",
            DeviceStatus::InvalidOpCode => "ERROR INVALID OP CODE",
            DeviceStatus::InvalidMeasurementType => "ERROR INVALID MEASUREMENT TYPE",
            DeviceStatus::NotSupported => "ERROR NOT SUPPORTED",
            DeviceStatus::InvalidLength => "ERROR INVALID LENGTH",
            DeviceStatus::InvalidParameter => "ERROR INVALID PARAMETER",
            DeviceStatus::AlreadyInState => "ERROR ALREADY IN STATE",
            DeviceStatus::InvalidResolution => "ERROR INVALID RESOLUTION",
            DeviceStatus::InvalidSampleRate => "ERROR INVALID SAMPLE RATE",
            DeviceStatus::InvalidRange => "ERROR INVALID RANGE",
            DeviceStatus::InvalidMtu => "ERROR INVALID MTU",
            DeviceStatus::InvalidNumberOfChannels => "ERROR INVALID NUMBER OF CHANNELS",
            DeviceStatus::InvalidState => "ERROR INVALID STATE",
            DeviceStatus::DeviceInCharger => "ERROR DEVICE IN CHARGER",
            DeviceStatus::Unknown(_) => "RESERVED FOR FUTURE USE",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

// ============================================================================
// Frame types
// ============================================================================

pub const ECG_FRAME_RES14: u8 = 0x00;

/// Accelerometer frame encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccFrameType {
    Res8,
    Res16,
    Res24,
    /// Reference sample plus delta-coded residuals.
    Delta,
}

impl AccFrameType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(AccFrameType::Res8),
            0x01 => Some(AccFrameType::Res16),
            0x02 => Some(AccFrameType::Res24),
            0x80 => Some(AccFrameType::Delta),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_codes() {
        assert_eq!(MeasurementType::from_code(0x00).unwrap(), MeasurementType::Ecg);
        assert_eq!(
            MeasurementType::from_code(0x05).unwrap(),
            MeasurementType::Gyroscope
        );
        assert_eq!(
            MeasurementType::from_code(0x06).unwrap(),
            MeasurementType::Magnetometer
        );
        for reserved in [0x04u8, 0x07, 0xFF] {
            assert_eq!(
                MeasurementType::from_code(reserved),
                Err(DecodeError::UnknownCode {
                    kind: CodeKind::MeasurementType,
                    code: reserved.into()
                })
            );
        }
        for m in MeasurementType::ALL {
            assert_eq!(MeasurementType::from_code(m.code()).unwrap(), m);
        }
    }

    #[test]
    fn test_measurement_names_parse() {
        assert_eq!("ecg".parse::<MeasurementType>().unwrap(), MeasurementType::Ecg);
        assert_eq!("ACC".parse::<MeasurementType>().unwrap(), MeasurementType::Acceleration);
        assert_eq!(
            "ppInterval".parse::<MeasurementType>().unwrap(),
            MeasurementType::PpInterval
        );
        assert!("eeg".parse::<MeasurementType>().is_err());
    }

    #[test]
    fn test_setting_tables() {
        let rates: Vec<u16> = SettingType::SampleRate.values().map(|v| v.value).collect();
        assert_eq!(rates, vec![25, 50, 52, 100, 130, 200]);
        let res: Vec<u16> = SettingType::Resolution.values().map(|v| v.value).collect();
        assert_eq!(res, vec![14, 16, 22]);
        let ranges: Vec<u16> = SettingType::Range.values().map(|v| v.value).collect();
        assert_eq!(ranges, vec![2, 4, 8]);

        let v = SettingType::SampleRate.resolve(0x0082).unwrap();
        assert_eq!(v.value, 130);
        assert_eq!(v.wire_bytes(), [0x82, 0x00]);
        assert_eq!(v.to_string(), "130 Hz");
        assert_eq!(SettingType::Resolution.encode(22), Some(0x0016));
    }

    #[test]
    fn test_unknown_setting_codes() {
        assert_eq!(
            SettingType::SampleRate.resolve(135),
            Err(DecodeError::UnknownCode {
                kind: CodeKind::SettingValue(SettingType::SampleRate),
                code: 135
            })
        );
        assert!(SettingType::from_code(0x03).is_err());
        assert_eq!(SettingType::from_code(0x04).unwrap(), SettingType::Channels);
    }

    #[test]
    fn test_device_status_table() {
        assert!(DeviceStatus::from_code(0).is_success());
        assert_eq!(DeviceStatus::from_code(6), DeviceStatus::AlreadyInState);
        assert_eq!(DeviceStatus::from_code(13), DeviceStatus::DeviceInCharger);
        assert_eq!(DeviceStatus::from_code(14), DeviceStatus::Unknown(14));
        assert_eq!(DeviceStatus::from_code(255).code(), 255);
        for code in 0..=13u8 {
            assert_eq!(DeviceStatus::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_feature_support_bits() {
        let support = FeatureSupport::from_flags(0x05);
        assert!(support.supports(MeasurementType::Ecg));
        assert!(support.supports(MeasurementType::Acceleration));
        assert!(!support.supports(MeasurementType::Ppg));
        let listed: Vec<_> = support.supported().collect();
        assert_eq!(listed, vec![MeasurementType::Ecg, MeasurementType::Acceleration]);
    }

    #[test]
    fn test_active_settings_resolve() {
        let settings = ActiveSettings::resolve(&[
            (SettingType::SampleRate, 0x0082),
            (SettingType::Resolution, 0x000E),
        ])
        .unwrap();
        assert_eq!(settings.sample_rate(), Some(130));
        assert_eq!(settings.resolution(), Some(14));
        assert_eq!(settings.range(), None);
        assert_eq!(
            serde_json::to_string(&settings).unwrap(),
            r#"{"samplerate":130,"resolution":14}"#
        );
        assert!(ActiveSettings::resolve(&[(SettingType::Range, 3)]).is_err());
    }
}
