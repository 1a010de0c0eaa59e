//! Python bindings, built with the `python` feature as the `_core` extension module.

use std::collections::HashMap;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyList};
use pyo3::IntoPyObjectExt;
use serde::Serialize;
use serde_json::Value;

use crate::codec::{decode_control_point_response, encode_get_settings, encode_start, encode_stop};
use crate::errors::PmdError;
use crate::frame::{decode_frame as decode_frame_payload, DecodedFrame};
use crate::hrs::parse_heart_rate_measurement;
use crate::logging::{init_python_logging, set_python_log_level};
use crate::negotiator::{Negotiator, NegotiatorConfig, Step, TransportRequest};
use crate::registry::{
    ActiveSettings, MeasurementType, SettingType, PMD_CONTROL_POINT_UUID, PMD_DATA_UUID,
    PMD_SERVICE_UUID,
};

fn pmd_err(e: PmdError) -> PyErr {
    match e {
        PmdError::Decode(e) => PyValueError::new_err(e.to_string()),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

fn measurement(name: &str) -> PyResult<MeasurementType> {
    name.parse().map_err(PyValueError::new_err)
}

fn settings(pairs: Vec<(String, u16)>) -> PyResult<Vec<(SettingType, u16)>> {
    pairs
        .into_iter()
        .map(|(name, value)| {
            name.parse::<SettingType>()
                .map(|setting| (setting, value))
                .map_err(PyValueError::new_err)
        })
        .collect()
}

fn json_to_py<'py>(py: Python<'py>, value: &Value) -> PyResult<Bound<'py, PyAny>> {
    match value {
        Value::Null => Ok(py.None().into_bound(py)),
        Value::Bool(b) => b.into_bound_py_any(py),
        Value::Number(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => u.into_bound_py_any(py),
            (None, Some(i)) => i.into_bound_py_any(py),
            _ => n.as_f64().unwrap_or(f64::NAN).into_bound_py_any(py),
        },
        Value::String(s) => s.as_str().into_bound_py_any(py),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            Ok(list.into_any())
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            Ok(dict.into_any())
        }
    }
}

fn to_py<'py, T: Serialize>(py: Python<'py>, value: &T) -> PyResult<Bound<'py, PyAny>> {
    let value = serde_json::to_value(value).map_err(|e| PyValueError::new_err(e.to_string()))?;
    json_to_py(py, &value)
}

/// `{"events": [...], "request": None | "read" | bytes}`
fn step_to_py<'py>(py: Python<'py>, step: &Step) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    let events = PyList::empty(py);
    for event in &step.events {
        events.append(to_py(py, event)?)?;
    }
    dict.set_item("events", events)?;
    match &step.request {
        None => dict.set_item("request", py.None())?,
        Some(TransportRequest::ReadControlPoint) => dict.set_item("request", "read")?,
        Some(TransportRequest::WriteControlPoint(bytes)) => {
            dict.set_item("request", PyBytes::new(py, bytes))?
        }
    }
    Ok(dict)
}

/// One decoded PMD data notification.
///
/// Attributes:
///     measurement: Stream name ("ecg", "acceleration", ...).
///     timestamp: Sensor tick count.
///     frame_type: Frame type byte.
///     samples: List of 1-tuples (ECG, PPG) or 3-tuples (x, y, z).
#[pyclass(name = "DecodedFrame", frozen)]
#[derive(Clone)]
struct PyDecodedFrame {
    #[pyo3(get)]
    measurement: String,
    #[pyo3(get)]
    timestamp: u64,
    #[pyo3(get)]
    frame_type: u8,
    #[pyo3(get)]
    samples: Vec<Vec<f64>>,
}

#[pymethods]
impl PyDecodedFrame {
    fn __repr__(&self) -> String {
        format!(
            "DecodedFrame(measurement={:?}, timestamp={}, samples={})",
            self.measurement,
            self.timestamp,
            self.samples.len()
        )
    }

    fn __len__(&self) -> usize {
        self.samples.len()
    }
}

impl From<DecodedFrame> for PyDecodedFrame {
    fn from(frame: DecodedFrame) -> Self {
        PyDecodedFrame {
            measurement: frame.measurement.name().to_owned(),
            timestamp: frame.timestamp,
            frame_type: frame.frame_type,
            samples: frame.samples.to_tuples(),
        }
    }
}

/// Control point state machine for one sensor.
///
/// Every method returns a dict with the events produced and the next
/// request for the transport: None, "read" (read the control point) or
/// bytes to write without response.
///
/// Example:
///     >>> n = Negotiator()
///     >>> n.characteristic_ready()["request"]
///     'read'
///     >>> n.handle_control_point(bytes([0x0F, 0x05]))["request"]
///     b'\x01\x00'
#[pyclass(name = "Negotiator", unsendable)]
struct PyNegotiator {
    inner: Negotiator,
}

#[pymethods]
impl PyNegotiator {
    /// Args:
    ///     max_retries: Re-sends before a request is abandoned by `ack_timed_out`.
    #[new]
    #[pyo3(signature = (max_retries=0))]
    fn new(max_retries: u32) -> Self {
        PyNegotiator {
            inner: Negotiator::new(NegotiatorConfig {
                max_retries,
                ..Default::default()
            }),
        }
    }

    fn characteristic_ready<'py>(&mut self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        step_to_py(py, &self.inner.characteristic_ready())
    }

    /// Raises:
    ///     ValueError: If the payload cannot be decoded. No state changes.
    fn handle_control_point<'py>(
        &mut self,
        py: Python<'py>,
        data: &[u8],
    ) -> PyResult<Bound<'py, PyDict>> {
        let step = self.inner.handle_control_point(data).map_err(pmd_err)?;
        step_to_py(py, &step)
    }

    /// Args:
    ///     measurement: "ecg", "acc", ...
    ///     settings: List of (setting, value) pairs, e.g. [("samplerate", 130)].
    ///         Defaults to the highest advertised value of every setting.
    #[pyo3(signature = (measurement, settings=None))]
    fn request_start<'py>(
        &mut self,
        py: Python<'py>,
        measurement: &str,
        settings: Option<Vec<(String, u16)>>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let measurement = self::measurement(measurement)?;
        let settings = match settings {
            Some(pairs) => self::settings(pairs)?,
            None => self.inner.preferred_settings(measurement).map_err(pmd_err)?,
        };
        let step = self
            .inner
            .request_start(measurement, &settings)
            .map_err(pmd_err)?;
        step_to_py(py, &step)
    }

    fn request_stop<'py>(&mut self, py: Python<'py>, measurement: &str) -> PyResult<Bound<'py, PyDict>> {
        let step = self
            .inner
            .request_stop(self::measurement(measurement)?)
            .map_err(pmd_err)?;
        step_to_py(py, &step)
    }

    /// Call when the pending request was not acknowledged in time.
    fn ack_timed_out<'py>(&mut self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        step_to_py(py, &self.inner.ack_timed_out())
    }

    /// Decode a data notification for a running stream.
    fn decode_data(&self, data: &[u8]) -> PyResult<PyDecodedFrame> {
        self.inner
            .decode_data(data)
            .map(PyDecodedFrame::from)
            .map_err(pmd_err)
    }

    /// Status of one measurement type, or None if the sensor does not support it.
    fn status<'py>(&self, py: Python<'py>, measurement: &str) -> PyResult<Option<Bound<'py, PyAny>>> {
        self.inner
            .feature(self::measurement(measurement)?)
            .map(|f| to_py(py, &f.status()))
            .transpose()
    }

    #[getter]
    fn supported(&self) -> Vec<&'static str> {
        self.inner
            .features()
            .map(|f| f.measurement().name())
            .collect()
    }

    #[getter]
    fn awaiting_ack(&self) -> bool {
        self.inner.awaiting_ack()
    }

    fn disconnect(&mut self) {
        self.inner.disconnect();
    }

    fn __repr__(&self) -> String {
        format!("Negotiator(supported={:?})", self.supported())
    }
}

#[pyfunction(name = "encode_get_settings")]
fn py_encode_get_settings<'py>(py: Python<'py>, measurement: &str) -> PyResult<Bound<'py, PyBytes>> {
    Ok(PyBytes::new(py, &encode_get_settings(self::measurement(measurement)?)))
}

#[pyfunction(name = "encode_start")]
#[pyo3(signature = (measurement, settings=Vec::new()))]
fn py_encode_start<'py>(
    py: Python<'py>,
    measurement: &str,
    settings: Vec<(String, u16)>,
) -> PyResult<Bound<'py, PyBytes>> {
    let bytes = encode_start(self::measurement(measurement)?, &self::settings(settings)?);
    Ok(PyBytes::new(py, &bytes))
}

#[pyfunction(name = "encode_stop")]
fn py_encode_stop<'py>(py: Python<'py>, measurement: &str) -> PyResult<Bound<'py, PyBytes>> {
    Ok(PyBytes::new(py, &encode_stop(self::measurement(measurement)?)))
}

/// Decode a control point notification into a dict.
#[pyfunction]
fn decode_control_point<'py>(py: Python<'py>, data: &[u8]) -> PyResult<Bound<'py, PyAny>> {
    let response =
        decode_control_point_response(data).map_err(|e| PyValueError::new_err(e.to_string()))?;
    to_py(py, &response)
}

/// Decode a data notification with explicit settings, e.g. {"resolution": 14}.
#[pyfunction]
#[pyo3(signature = (data, settings=None))]
fn decode_frame(data: &[u8], settings: Option<HashMap<String, u16>>) -> PyResult<PyDecodedFrame> {
    let pairs = self::settings(settings.unwrap_or_default().into_iter().collect())?;
    let active =
        ActiveSettings::resolve(&pairs).map_err(|e| PyValueError::new_err(e.to_string()))?;
    decode_frame_payload(data, &active)
        .map(PyDecodedFrame::from)
        .map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Parse a Heart Rate Measurement notification.
#[pyfunction]
fn decode_heart_rate<'py>(py: Python<'py>, data: &[u8]) -> PyResult<Bound<'py, PyAny>> {
    let hr = parse_heart_rate_measurement(data).map_err(|e| PyValueError::new_err(e.to_string()))?;
    to_py(py, &hr)
}

/// Set the level of Rust log records forwarded to Python `logging`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    set_python_log_level(py, level)
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    init_python_logging(m.py())?;

    m.add_class::<PyNegotiator>()?;
    m.add_class::<PyDecodedFrame>()?;
    m.add_function(wrap_pyfunction!(py_encode_get_settings, m)?)?;
    m.add_function(wrap_pyfunction!(py_encode_start, m)?)?;
    m.add_function(wrap_pyfunction!(py_encode_stop, m)?)?;
    m.add_function(wrap_pyfunction!(decode_control_point, m)?)?;
    m.add_function(wrap_pyfunction!(decode_frame, m)?)?;
    m.add_function(wrap_pyfunction!(decode_heart_rate, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("PMD_SERVICE_UUID", PMD_SERVICE_UUID.to_string())?;
    m.add("PMD_CONTROL_POINT_UUID", PMD_CONTROL_POINT_UUID.to_string())?;
    m.add("PMD_DATA_UUID", PMD_DATA_UUID.to_string())?;
    m.add(
        "MEASUREMENT_TYPES",
        MeasurementType::ALL.iter().map(|m| m.name()).collect::<Vec<_>>(),
    )?;

    Ok(())
}
