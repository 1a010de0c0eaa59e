//! Polar Measurement Data (PMD) protocol engine with optional Python bindings.
//!
//! Polar sensors (H10, Verity Sense, OH1, ...) stream ECG, accelerometer and
//! other raw signals over a vendor GATT service. Before a stream starts, the
//! host negotiates it over a single control point characteristic: read the
//! feature bitmap, ask for the settings each measurement type offers, then
//! START with a chosen sample rate, resolution and range. Data then arrives as
//! notifications on a separate characteristic.
//!
//! This crate is the part between the Bluetooth stack and the application:
//!
//! - [`Negotiator`]: per-sensor state machine that serializes control point
//!   traffic and tracks every measurement type from discovery to stop.
//! - [`decode_frame`]: turns data notifications into normalized samples.
//! - [`StreamSession`] and [`SampleSink`]: forward decoded frames of a running stream.
//! - [`spawn_sensor`]: runs one negotiator per sensor as a tokio task.
//!
//! The transport itself (scanning, connecting, GATT discovery) is left to the
//! caller: it hands notification bytes in and performs the
//! [`TransportRequest`]s that come back.
//!
//! # Timestamps
//!
//! Frames carry the sensor's own 64-bit tick count. It is passed through
//! untouched and is not wall-clock time.

mod codec;
mod errors;
mod frame;
mod hrs;
mod logging;
mod negotiator;
mod registry;
mod sensor;
mod session;

#[cfg(feature = "python")]
mod python;

pub use codec::{
    decode_control_point_response, decode_feature_read, encode_get_settings, encode_start,
    encode_stop, ControlPointResponse, SettingParameter,
};
pub use errors::*;
pub use frame::{decode_frame, normalize, sign_extend, DecodedFrame, Samples, DEFAULT_ECG_RESOLUTION};
pub use hrs::{
    parse_battery_level, parse_heart_rate_measurement, BodySensorLocation, HeartRateMeasurement,
};
pub use logging::{env_level, init_rust_logging};
pub use negotiator::{
    ControlRequest, FeatureEvent, FeatureState, FeatureStatus, NegotiationEvent, Negotiator,
    NegotiatorConfig, Step, TransportRequest,
};
pub use registry::*;
pub use sensor::{spawn_sensor, ControlTransport, SensorHandle, SensorUpdate};
pub use session::{SampleBatch, SampleSink, StreamSession};
