use std::fmt;

use thiserror::Error;

use crate::negotiator::FeatureStatus;
use crate::registry::{DeviceStatus, MeasurementType, Operation, SettingType};

/// The code table a numeric code was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    MeasurementType,
    SettingType,
    SettingValue(SettingType),
    OpCode,
    BodySensorLocation,
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeKind::MeasurementType => f.write_str("measurement type"),
            CodeKind::SettingType => f.write_str("setting type"),
            CodeKind::SettingValue(setting) => write!(f, "{} value", setting.name()),
            CodeKind::OpCode => f.write_str("op code"),
            CodeKind::BodySensorLocation => f.write_str("body sensor location"),
        }
    }
}

/// Failure to interpret a notification payload. Always local: the payload is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown control point response type: {0:#04x}")]
    UnknownResponseType(u8),
    #[error("truncated payload: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported {measurement} frame type: {frame_type:#04x}")]
    UnsupportedFrameType {
        measurement: MeasurementType,
        frame_type: u8,
    },
    #[error("unknown {kind} code: {code:#06x}")]
    UnknownCode { kind: CodeKind, code: u16 },
}

/// A control point operation the sensor answered with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("device rejected {operation} for {measurement}: {status}")]
    DeviceRejected {
        measurement: MeasurementType,
        status: DeviceStatus,
        operation: Operation,
    },
}

#[derive(Debug, Error)]
pub enum PmdError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0} is not supported by the sensor")]
    NotSupported(MeasurementType),
    #[error("{measurement} is not running (status: {status})")]
    NotRunning {
        measurement: MeasurementType,
        status: FeatureStatus,
    },
    #[error("cannot {operation} {measurement} while {status}")]
    InvalidState {
        measurement: MeasurementType,
        status: FeatureStatus,
        operation: Operation,
    },
    #[error("{measurement} does not offer {setting} value {value}")]
    UnknownSetting {
        measurement: MeasurementType,
        setting: SettingType,
        value: u16,
    },
    #[error("{got} notification delivered to the {expected} stream")]
    WrongStream {
        expected: MeasurementType,
        got: MeasurementType,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("sensor task is gone")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PmdError>;
