//! Per-sensor negotiation state machine.
//!
//! The [`Negotiator`] owns one [`FeatureState`] per measurement type the
//! sensor announced. It consumes decoded control point responses, decides
//! which request goes out next and tells the caller what to write. It never
//! performs I/O itself: every entry point returns a [`Step`] with the events
//! that happened and, at most, one transport request.
//!
//! The control point has no request ids, so only one request may be awaiting
//! its acknowledgement at any time. Everything else waits in a FIFO queue.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::codec::{
    decode_control_point_response, encode_get_settings, encode_start, encode_stop,
    ControlPointResponse, SettingParameter,
};
use crate::errors::{DecodeError, PmdError, ProtocolError, Result};
use crate::frame::{decode_frame, DecodedFrame};
use crate::registry::{
    ActiveSettings, DeviceStatus, FeatureSupport, MeasurementType, Operation, SettingType,
};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for one sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// How long to wait for an acknowledgement. `None` waits forever.
    pub ack_timeout: Option<Duration>,
    /// Re-sends of an unacknowledged request before it is abandoned.
    pub max_retries: u32,
    /// Capacity of the sensor actor's update channel.
    pub event_buffer: usize,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ack_timeout: None,
            max_retries: 0,
            event_buffer: 256,
        }
    }
}

// ============================================================================
// Feature status
// ============================================================================

/// Lifecycle of one measurement type on one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FeatureStatus {
    Idle,
    SettingsRequested,
    SettingsReady,
    StartPending,
    Running,
    StopPending,
    Stopped,
    /// The device answered with a non-success status. Not terminal.
    Errored {
        status: DeviceStatus,
        operation: Operation,
    },
    /// No acknowledgement arrived within the configured timeout and retries.
    Unacknowledged { operation: Operation },
}

/// Input to [`FeatureStatus::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureEvent {
    SettingsRequested,
    StartSubmitted,
    StopSubmitted,
    Acknowledged {
        operation: Operation,
        status: DeviceStatus,
    },
    AckTimedOut(Operation),
}

impl FeatureStatus {
    /// Operation whose acknowledgement this state is waiting for.
    pub fn pending_operation(self) -> Option<Operation> {
        match self {
            FeatureStatus::SettingsRequested => Some(Operation::GetSettings),
            FeatureStatus::StartPending => Some(Operation::Start),
            FeatureStatus::StopPending => Some(Operation::Stop),
            _ => None,
        }
    }

    pub fn is_running(self) -> bool {
        self == FeatureStatus::Running
    }

    /// Next state, or `None` when the event does not apply in this state.
    pub fn transition(&self, event: &FeatureEvent) -> Option<FeatureStatus> {
        use FeatureStatus::*;

        match (*self, *event) {
            (Idle, FeatureEvent::SettingsRequested) => Some(SettingsRequested),
            (
                SettingsReady | Stopped | Errored { .. } | Unacknowledged { .. },
                FeatureEvent::StartSubmitted,
            ) => Some(StartPending),
            (
                Running | Errored { .. } | Unacknowledged { .. },
                FeatureEvent::StopSubmitted,
            ) => Some(StopPending),
            (state, FeatureEvent::Acknowledged { operation, status })
                if state.pending_operation() == Some(operation) =>
            {
                if !status.is_success() {
                    return Some(Errored { status, operation });
                }
                Some(match operation {
                    Operation::GetSettings => SettingsReady,
                    Operation::Start => Running,
                    Operation::Stop => Stopped,
                })
            }
            (state, FeatureEvent::AckTimedOut(operation))
                if state.pending_operation() == Some(operation) =>
            {
                Some(Unacknowledged { operation })
            }
            _ => None,
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureStatus::Idle => f.write_str("idle"),
            FeatureStatus::SettingsRequested => f.write_str("settings requested"),
            FeatureStatus::SettingsReady => f.write_str("settings ready"),
            FeatureStatus::StartPending => f.write_str("start pending"),
            FeatureStatus::Running => f.write_str("running"),
            FeatureStatus::StopPending => f.write_str("stop pending"),
            FeatureStatus::Stopped => f.write_str("stopped"),
            FeatureStatus::Errored { status, operation } => {
                write!(f, "errored ({status} on {operation})")
            }
            FeatureStatus::Unacknowledged { operation } => {
                write!(f, "unacknowledged {operation}")
            }
        }
    }
}

// ============================================================================
// Feature state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestedSettings {
    raw: Vec<(SettingType, u16)>,
    resolved: ActiveSettings,
}

/// Everything known about one measurement type on a connected sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureState {
    measurement: MeasurementType,
    parameters: Vec<SettingParameter>,
    requested: Option<RequestedSettings>,
    active: Option<ActiveSettings>,
    status: FeatureStatus,
}

impl FeatureState {
    fn new(measurement: MeasurementType) -> Self {
        Self {
            measurement,
            parameters: Vec::new(),
            requested: None,
            active: None,
            status: FeatureStatus::Idle,
        }
    }

    pub fn measurement(&self) -> MeasurementType {
        self.measurement
    }

    /// Settings the sensor advertised, in the order it sent them.
    pub fn parameters(&self) -> &[SettingParameter] {
        &self.parameters
    }

    /// `(setting, raw code)` pairs sent with the last START.
    pub fn requested_settings(&self) -> Option<&[(SettingType, u16)]> {
        self.requested.as_ref().map(|r| r.raw.as_slice())
    }

    /// Settings in effect. Present exactly while the stream is running.
    pub fn active_settings(&self) -> Option<&ActiveSettings> {
        self.active.as_ref()
    }

    pub fn status(&self) -> FeatureStatus {
        self.status
    }

    fn apply(&mut self, event: FeatureEvent) -> bool {
        let Some(next) = self.status.transition(&event) else {
            return false;
        };
        if next != self.status {
            info!("{}: {} -> {}", self.measurement, self.status, next);
        }
        self.status = next;
        self.active = match next {
            FeatureStatus::Running => self.requested.as_ref().map(|r| r.resolved.clone()),
            _ => None,
        };
        if next == FeatureStatus::Stopped {
            self.requested = None;
        }
        true
    }
}

// ============================================================================
// Requests and events
// ============================================================================

/// A control point request queued or awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "request", rename_all = "camelCase")]
pub enum ControlRequest {
    ReadFeatures,
    GetSettings {
        measurement: MeasurementType,
    },
    Start {
        measurement: MeasurementType,
        settings: Vec<(SettingType, u16)>,
    },
    Stop {
        measurement: MeasurementType,
    },
}

impl ControlRequest {
    pub fn measurement(&self) -> Option<MeasurementType> {
        match self {
            ControlRequest::ReadFeatures => None,
            ControlRequest::GetSettings { measurement }
            | ControlRequest::Start { measurement, .. }
            | ControlRequest::Stop { measurement } => Some(*measurement),
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        match self {
            ControlRequest::ReadFeatures => None,
            ControlRequest::GetSettings { .. } => Some(Operation::GetSettings),
            ControlRequest::Start { .. } => Some(Operation::Start),
            ControlRequest::Stop { .. } => Some(Operation::Stop),
        }
    }

    fn to_transport(&self) -> TransportRequest {
        match self {
            ControlRequest::ReadFeatures => TransportRequest::ReadControlPoint,
            ControlRequest::GetSettings { measurement } => {
                TransportRequest::WriteControlPoint(encode_get_settings(*measurement))
            }
            ControlRequest::Start {
                measurement,
                settings,
            } => TransportRequest::WriteControlPoint(encode_start(*measurement, settings)),
            ControlRequest::Stop { measurement } => {
                TransportRequest::WriteControlPoint(encode_stop(*measurement))
            }
        }
    }

    fn answered_by(&self, response: &ControlPointResponse) -> bool {
        let measurement = match response {
            ControlPointResponse::FeatureRead(_) => {
                return *self == ControlRequest::ReadFeatures;
            }
            ControlPointResponse::SettingsMap { measurement, .. }
            | ControlPointResponse::StartAck { measurement, .. }
            | ControlPointResponse::StopAck { measurement, .. } => *measurement,
        };
        self.measurement() == Some(measurement) && self.operation() == response.operation()
    }
}

/// What the transport must do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "bytes", rename_all = "camelCase")]
pub enum TransportRequest {
    /// Read the control point value (the feature bitmap).
    ReadControlPoint,
    /// Write without response to the control point.
    WriteControlPoint(#[serde(serialize_with = "as_hex")] Vec<u8>),
}

fn as_hex<S: serde::Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

/// Something callers should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum NegotiationEvent {
    FeaturesDiscovered {
        support: FeatureSupport,
        measurements: Vec<MeasurementType>,
    },
    SettingsReady {
        measurement: MeasurementType,
        parameters: Vec<SettingParameter>,
    },
    Started {
        measurement: MeasurementType,
        settings: ActiveSettings,
    },
    Stopped {
        measurement: MeasurementType,
    },
    Rejected {
        measurement: MeasurementType,
        operation: Operation,
        status: DeviceStatus,
    },
    TimedOut {
        request: ControlRequest,
    },
}

impl NegotiationEvent {
    /// The device-side failure this event reports, if any.
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        match self {
            NegotiationEvent::Rejected {
                measurement,
                operation,
                status,
            } => Some(ProtocolError::DeviceRejected {
                measurement: *measurement,
                status: *status,
                operation: *operation,
            }),
            _ => None,
        }
    }
}

/// Outcome of feeding one input to the negotiator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub events: Vec<NegotiationEvent>,
    pub request: Option<TransportRequest>,
}

#[derive(Debug, Clone)]
struct InFlight {
    request: ControlRequest,
    attempts: u32,
}

// ============================================================================
// Negotiator
// ============================================================================

/// Control point state for one connected sensor.
///
/// # Example
/// ```
/// use polar_pmd::{Negotiator, NegotiatorConfig, TransportRequest};
///
/// let mut negotiator = Negotiator::new(NegotiatorConfig::default());
/// let step = negotiator.characteristic_ready();
/// assert_eq!(step.request, Some(TransportRequest::ReadControlPoint));
///
/// // ECG and accelerometer supported
/// let step = negotiator.handle_control_point(&[0x0F, 0x05]).unwrap();
/// assert_eq!(step.request, Some(TransportRequest::WriteControlPoint(vec![0x01, 0x00])));
/// ```
#[derive(Debug, Default)]
pub struct Negotiator {
    config: NegotiatorConfig,
    support: Option<FeatureSupport>,
    features: BTreeMap<MeasurementType, FeatureState>,
    queue: VecDeque<ControlRequest>,
    in_flight: Option<InFlight>,
}

impl Negotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Feature bitmap, once the sensor has answered the feature read.
    pub fn support(&self) -> Option<FeatureSupport> {
        self.support
    }

    pub fn feature(&self, measurement: MeasurementType) -> Option<&FeatureState> {
        self.features.get(&measurement)
    }

    pub fn features(&self) -> impl Iterator<Item = &FeatureState> {
        self.features.values()
    }

    /// True while a request is waiting for its acknowledgement.
    pub fn awaiting_ack(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Service discovery finished: ask for the feature bitmap.
    pub fn characteristic_ready(&mut self) -> Step {
        let mut step = Step::default();
        self.queue.push_back(ControlRequest::ReadFeatures);
        self.pump(&mut step);
        step
    }

    /// Feed one control point notification (or read result).
    ///
    /// Undecodable payloads are returned as errors and leave every state untouched.
    pub fn handle_control_point(&mut self, bytes: &[u8]) -> Result<Step> {
        let response = decode_control_point_response(bytes)?;
        debug!("control point <- {} ({:?})", hex::encode(bytes), response);

        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.request.answered_by(&response))
        {
            self.in_flight = None;
        }

        let mut step = Step::default();
        match response {
            ControlPointResponse::FeatureRead(support) => self.on_features(support, &mut step),
            ControlPointResponse::SettingsMap {
                measurement,
                status,
                parameters,
                ..
            } => {
                if self.acknowledge(measurement, Operation::GetSettings, status, &mut step) {
                    if let Some(feature) = self.features.get_mut(&measurement) {
                        feature.parameters = parameters.clone();
                    }
                    step.events.push(NegotiationEvent::SettingsReady {
                        measurement,
                        parameters,
                    });
                }
            }
            ControlPointResponse::StartAck {
                measurement,
                status,
                ..
            } => {
                if self.acknowledge(measurement, Operation::Start, status, &mut step) {
                    let settings = self
                        .features
                        .get(&measurement)
                        .and_then(|f| f.active.clone())
                        .unwrap_or_default();
                    step.events.push(NegotiationEvent::Started {
                        measurement,
                        settings,
                    });
                }
            }
            ControlPointResponse::StopAck {
                measurement,
                status,
            } => {
                if self.acknowledge(measurement, Operation::Stop, status, &mut step) {
                    step.events.push(NegotiationEvent::Stopped { measurement });
                }
            }
        }

        self.pump(&mut step);
        Ok(step)
    }

    /// Queue a START with `(setting, raw code)` pairs.
    ///
    /// Every value must be documented and advertised by the sensor for this
    /// measurement type.
    pub fn request_start(
        &mut self,
        measurement: MeasurementType,
        settings: &[(SettingType, u16)],
    ) -> Result<Step> {
        let feature = self
            .features
            .get_mut(&measurement)
            .ok_or(PmdError::NotSupported(measurement))?;

        for &(setting, value) in settings {
            let offered = feature
                .parameters
                .iter()
                .find(|p| p.setting == setting)
                .is_some_and(|p| p.offers(value));
            if !offered || setting.resolve(value).is_err() {
                return Err(PmdError::UnknownSetting {
                    measurement,
                    setting,
                    value,
                });
            }
        }
        let resolved = ActiveSettings::resolve(settings)?;

        let previous = feature.requested.replace(RequestedSettings {
            raw: settings.to_vec(),
            resolved,
        });
        if !feature.apply(FeatureEvent::StartSubmitted) {
            feature.requested = previous;
            return Err(PmdError::InvalidState {
                measurement,
                status: feature.status,
                operation: Operation::Start,
            });
        }

        let mut step = Step::default();
        self.queue.push_back(ControlRequest::Start {
            measurement,
            settings: settings.to_vec(),
        });
        self.pump(&mut step);
        Ok(step)
    }

    pub fn request_stop(&mut self, measurement: MeasurementType) -> Result<Step> {
        let feature = self
            .features
            .get_mut(&measurement)
            .ok_or(PmdError::NotSupported(measurement))?;
        if !feature.apply(FeatureEvent::StopSubmitted) {
            return Err(PmdError::InvalidState {
                measurement,
                status: feature.status,
                operation: Operation::Stop,
            });
        }

        let mut step = Step::default();
        self.queue.push_back(ControlRequest::Stop { measurement });
        self.pump(&mut step);
        Ok(step)
    }

    /// Highest advertised value of every setting, in advertised order.
    pub fn preferred_settings(&self, measurement: MeasurementType) -> Result<Vec<(SettingType, u16)>> {
        let feature = self
            .features
            .get(&measurement)
            .ok_or(PmdError::NotSupported(measurement))?;
        Ok(feature
            .parameters
            .iter()
            .filter_map(|p| p.highest().map(|v| (p.setting, v.raw)))
            .collect())
    }

    /// The acknowledgement deadline for the in-flight request passed.
    ///
    /// Re-sends the request while retries remain, otherwise abandons it and
    /// releases the next queued request.
    pub fn ack_timed_out(&mut self) -> Step {
        let mut step = Step::default();
        let Some(mut in_flight) = self.in_flight.take() else {
            return step;
        };

        if in_flight.attempts <= self.config.max_retries {
            in_flight.attempts += 1;
            warn!(
                "no acknowledgement for {:?}, retrying (attempt {})",
                in_flight.request, in_flight.attempts
            );
            step.request = Some(in_flight.request.to_transport());
            self.in_flight = Some(in_flight);
            return step;
        }

        warn!(
            "giving up on {:?} after {} attempt(s)",
            in_flight.request, in_flight.attempts
        );
        if let (Some(measurement), Some(operation)) =
            (in_flight.request.measurement(), in_flight.request.operation())
        {
            if let Some(feature) = self.features.get_mut(&measurement) {
                feature.apply(FeatureEvent::AckTimedOut(operation));
            }
        }
        step.events.push(NegotiationEvent::TimedOut {
            request: in_flight.request,
        });
        self.pump(&mut step);
        step
    }

    /// Decode a data notification for a running stream.
    pub fn decode_data(&self, payload: &[u8]) -> Result<DecodedFrame> {
        let code = *payload.first().ok_or(DecodeError::Truncated {
            needed: 1,
            available: 0,
        })?;
        let measurement = MeasurementType::from_code(code)?;
        let feature = self
            .features
            .get(&measurement)
            .ok_or(PmdError::NotSupported(measurement))?;
        let settings = feature.active.as_ref().ok_or(PmdError::NotRunning {
            measurement,
            status: feature.status,
        })?;
        Ok(decode_frame(payload, settings)?)
    }

    /// The link dropped: forget everything about this sensor.
    pub fn disconnect(&mut self) {
        info!("sensor disconnected, discarding {} feature state(s)", self.features.len());
        self.support = None;
        self.features.clear();
        self.queue.clear();
        self.in_flight = None;
    }

    fn on_features(&mut self, support: FeatureSupport, step: &mut Step) {
        if self.support.is_some() {
            warn!("ignoring repeated feature read ({:#04x})", support.flags());
            return;
        }
        self.support = Some(support);
        let measurements: Vec<_> = support.supported().collect();
        info!("sensor supports {:?}", measurements);

        for &measurement in &measurements {
            let mut feature = FeatureState::new(measurement);
            feature.apply(FeatureEvent::SettingsRequested);
            self.features.insert(measurement, feature);
            self.queue.push_back(ControlRequest::GetSettings { measurement });
        }
        step.events.push(NegotiationEvent::FeaturesDiscovered {
            support,
            measurements,
        });
    }

    /// Apply an acknowledgement. Returns true when it succeeded and changed state.
    fn acknowledge(
        &mut self,
        measurement: MeasurementType,
        operation: Operation,
        status: DeviceStatus,
        step: &mut Step,
    ) -> bool {
        let Some(feature) = self.features.get_mut(&measurement) else {
            warn!("{operation} acknowledgement for unsupported {measurement}");
            return false;
        };
        if !feature.apply(FeatureEvent::Acknowledged { operation, status }) {
            debug!(
                "ignoring {operation} acknowledgement for {measurement} while {}",
                feature.status
            );
            return false;
        }
        if !status.is_success() {
            warn!("{measurement}: device rejected {operation}: {status}");
            step.events.push(NegotiationEvent::Rejected {
                measurement,
                operation,
                status,
            });
            return false;
        }
        true
    }

    fn pump(&mut self, step: &mut Step) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(request) = self.queue.pop_front() {
            let transport = request.to_transport();
            debug!("control point -> {:?}", transport);
            self.in_flight = Some(InFlight {
                request,
                attempts: 1,
            });
            step.request = Some(transport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ECG_SETTINGS: [u8; 13] = [
        0xF0, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x82, 0x00, 0x01, 0x01, 0x0E, 0x00,
    ];
    const ACC_SETTINGS: [u8; 27] = [
        0xF0, 0x01, 0x02, 0x00, 0x00, 0x00, 0x04, 0x19, 0x00, 0x32, 0x00, 0x64, 0x00, 0xC8, 0x00,
        0x01, 0x01, 0x10, 0x00, 0x02, 0x03, 0x02, 0x00, 0x04, 0x00, 0x08, 0x00,
    ];
    const ECG_START_OK: [u8; 5] = [0xF0, 0x02, 0x00, 0x00, 0x00];
    const ECG_STOP_OK: [u8; 4] = [0xF0, 0x03, 0x00, 0x00];
    const ECG_FRAME: [u8; 13] = [
        0x00, 1, 0, 0, 0, 0, 0, 0, 0, 0x00, 0xFF, 0x1F, 0x00,
    ];

    fn write(bytes: &[u8]) -> Option<TransportRequest> {
        Some(TransportRequest::WriteControlPoint(bytes.to_vec()))
    }

    /// Negotiator with ECG and ACC discovered and both settings maps received.
    fn ready_negotiator() -> Negotiator {
        let mut n = Negotiator::new(NegotiatorConfig::default());
        n.characteristic_ready();
        n.handle_control_point(&[0x0F, 0x05]).unwrap();
        n.handle_control_point(&ECG_SETTINGS).unwrap();
        n.handle_control_point(&ACC_SETTINGS).unwrap();
        n
    }

    #[test]
    fn test_transition_table() {
        use FeatureStatus::*;
        let ok = |operation| FeatureEvent::Acknowledged {
            operation,
            status: DeviceStatus::Success,
        };
        let busy = |operation| FeatureEvent::Acknowledged {
            operation,
            status: DeviceStatus::AlreadyInState,
        };

        assert_eq!(Idle.transition(&FeatureEvent::SettingsRequested), Some(SettingsRequested));
        assert_eq!(SettingsRequested.transition(&ok(Operation::GetSettings)), Some(SettingsReady));
        assert_eq!(SettingsReady.transition(&FeatureEvent::StartSubmitted), Some(StartPending));
        assert_eq!(StartPending.transition(&ok(Operation::Start)), Some(Running));
        assert_eq!(Running.transition(&FeatureEvent::StopSubmitted), Some(StopPending));
        assert_eq!(StopPending.transition(&ok(Operation::Stop)), Some(Stopped));
        assert_eq!(Stopped.transition(&FeatureEvent::StartSubmitted), Some(StartPending));

        let errored = StartPending.transition(&busy(Operation::Start)).unwrap();
        assert_eq!(
            errored,
            Errored {
                status: DeviceStatus::AlreadyInState,
                operation: Operation::Start
            }
        );
        assert_eq!(errored.transition(&FeatureEvent::StartSubmitted), Some(StartPending));
        assert_eq!(errored.transition(&FeatureEvent::StopSubmitted), Some(StopPending));

        assert_eq!(
            StopPending.transition(&FeatureEvent::AckTimedOut(Operation::Stop)),
            Some(Unacknowledged {
                operation: Operation::Stop
            })
        );

        // Mismatched or out-of-order inputs are ignored.
        assert_eq!(StartPending.transition(&ok(Operation::Stop)), None);
        assert_eq!(Running.transition(&ok(Operation::Start)), None);
        assert_eq!(Running.transition(&FeatureEvent::StartSubmitted), None);
        assert_eq!(Idle.transition(&FeatureEvent::StartSubmitted), None);
        assert_eq!(
            Running.transition(&FeatureEvent::AckTimedOut(Operation::Start)),
            None
        );
    }

    #[test]
    fn test_discovery_is_sequential() {
        let mut n = Negotiator::new(NegotiatorConfig::default());
        assert_eq!(
            n.characteristic_ready().request,
            Some(TransportRequest::ReadControlPoint)
        );

        let step = n.handle_control_point(&[0x0F, 0x05]).unwrap();
        assert_eq!(step.request, write(&[0x01, 0x00]));
        assert!(matches!(
            step.events[0],
            NegotiationEvent::FeaturesDiscovered { .. }
        ));
        assert_eq!(
            n.feature(MeasurementType::Acceleration).unwrap().status(),
            FeatureStatus::SettingsRequested
        );
        assert!(n.feature(MeasurementType::Ppg).is_none());

        // The ACC request only goes out once ECG is answered.
        let step = n.handle_control_point(&ECG_SETTINGS).unwrap();
        assert_eq!(step.request, write(&[0x01, 0x02]));
        assert_eq!(
            n.feature(MeasurementType::Ecg).unwrap().status(),
            FeatureStatus::SettingsReady
        );

        let step = n.handle_control_point(&ACC_SETTINGS).unwrap();
        assert_eq!(step.request, None);
        assert!(!n.awaiting_ack());
        assert_eq!(n.feature(MeasurementType::Acceleration).unwrap().parameters().len(), 3);
    }

    #[test]
    fn test_start_stream_and_stop() {
        let mut n = ready_negotiator();
        let step = n
            .request_start(
                MeasurementType::Ecg,
                &[(SettingType::SampleRate, 130), (SettingType::Resolution, 14)],
            )
            .unwrap();
        assert_eq!(
            step.request,
            write(&[0x02, 0x00, 0x00, 0x01, 0x82, 0x00, 0x01, 0x01, 0x0E, 0x00])
        );
        let ecg = n.feature(MeasurementType::Ecg).unwrap();
        assert_eq!(ecg.status(), FeatureStatus::StartPending);
        assert!(ecg.active_settings().is_none());
        assert!(matches!(
            n.decode_data(&ECG_FRAME),
            Err(PmdError::NotRunning { .. })
        ));

        let step = n.handle_control_point(&ECG_START_OK).unwrap();
        let NegotiationEvent::Started { settings, .. } = &step.events[0] else {
            panic!("expected started event, got {:?}", step.events);
        };
        assert_eq!(settings.sample_rate(), Some(130));
        assert_eq!(settings.resolution(), Some(14));

        let frame = n.decode_data(&ECG_FRAME).unwrap();
        assert_eq!(frame.timestamp, 1);
        assert_eq!(frame.samples.len(), 1);

        n.request_stop(MeasurementType::Ecg).unwrap();
        assert!(n.feature(MeasurementType::Ecg).unwrap().active_settings().is_none());
        let step = n.handle_control_point(&ECG_STOP_OK).unwrap();
        assert_eq!(
            step.events,
            vec![NegotiationEvent::Stopped {
                measurement: MeasurementType::Ecg
            }]
        );
        let ecg = n.feature(MeasurementType::Ecg).unwrap();
        assert_eq!(ecg.status(), FeatureStatus::Stopped);
        assert!(ecg.requested_settings().is_none());
        assert!(n.decode_data(&ECG_FRAME).is_err());
    }

    #[test]
    fn test_rejected_start_can_be_retried() {
        let mut n = ready_negotiator();
        n.request_start(MeasurementType::Ecg, &[]).unwrap();
        let step = n
            .handle_control_point(&[0xF0, 0x02, 0x00, 0x06, 0x00])
            .unwrap();
        assert_eq!(
            step.events[0].protocol_error(),
            Some(ProtocolError::DeviceRejected {
                measurement: MeasurementType::Ecg,
                status: DeviceStatus::AlreadyInState,
                operation: Operation::Start
            })
        );
        assert!(matches!(
            n.feature(MeasurementType::Ecg).unwrap().status(),
            FeatureStatus::Errored { .. }
        ));

        let step = n.request_start(MeasurementType::Ecg, &[]).unwrap();
        assert_eq!(step.request, write(&[0x02, 0x00]));
    }

    #[test]
    fn test_rejected_settings_request_still_allows_start() {
        let mut n = Negotiator::new(NegotiatorConfig::default());
        n.characteristic_ready();
        n.handle_control_point(&[0x0F, 0x01]).unwrap();

        let step = n
            .handle_control_point(&[0xF0, 0x01, 0x00, 0x03, 0x00])
            .unwrap();
        assert_eq!(
            step.events,
            vec![NegotiationEvent::Rejected {
                measurement: MeasurementType::Ecg,
                operation: Operation::GetSettings,
                status: DeviceStatus::NotSupported
            }]
        );
        assert!(!n.awaiting_ack());
        let ecg = n.feature(MeasurementType::Ecg).unwrap();
        assert_eq!(
            ecg.status(),
            FeatureStatus::Errored {
                status: DeviceStatus::NotSupported,
                operation: Operation::GetSettings
            }
        );
        assert!(ecg.parameters().is_empty());

        // Nothing was advertised, so only a START without settings is accepted.
        assert!(matches!(
            n.request_start(MeasurementType::Ecg, &[(SettingType::SampleRate, 130)]),
            Err(PmdError::UnknownSetting { .. })
        ));
        let step = n.request_start(MeasurementType::Ecg, &[]).unwrap();
        assert_eq!(step.request, write(&[0x02, 0x00]));
        assert_eq!(
            n.feature(MeasurementType::Ecg).unwrap().status(),
            FeatureStatus::StartPending
        );
    }

    #[test]
    fn test_start_validation() {
        let mut n = ready_negotiator();
        assert!(matches!(
            n.request_start(MeasurementType::Ecg, &[(SettingType::SampleRate, 200)]),
            Err(PmdError::UnknownSetting { value: 200, .. })
        ));
        assert!(matches!(
            n.request_start(MeasurementType::Ecg, &[(SettingType::Range, 2)]),
            Err(PmdError::UnknownSetting { .. })
        ));
        assert!(matches!(
            n.request_start(MeasurementType::Ppg, &[]),
            Err(PmdError::NotSupported(MeasurementType::Ppg))
        ));
        assert!(matches!(
            n.request_stop(MeasurementType::Ecg),
            Err(PmdError::InvalidState {
                operation: Operation::Stop,
                ..
            })
        ));
        // Rejected requests leave nothing behind.
        assert_eq!(
            n.feature(MeasurementType::Ecg).unwrap().status(),
            FeatureStatus::SettingsReady
        );
        assert!(!n.awaiting_ack());
    }

    #[test]
    fn test_requests_queue_behind_in_flight() {
        let mut n = ready_negotiator();
        n.request_start(MeasurementType::Ecg, &[]).unwrap();
        let step = n
            .request_start(MeasurementType::Acceleration, &[(SettingType::Range, 8)])
            .unwrap();
        assert_eq!(step.request, None);

        let step = n.handle_control_point(&ECG_START_OK).unwrap();
        assert_eq!(step.request, write(&[0x02, 0x02, 0x02, 0x01, 0x08, 0x00]));
    }

    #[test]
    fn test_preferred_settings() {
        let n = ready_negotiator();
        assert_eq!(
            n.preferred_settings(MeasurementType::Acceleration).unwrap(),
            vec![
                (SettingType::SampleRate, 200),
                (SettingType::Resolution, 16),
                (SettingType::Range, 8)
            ]
        );
    }

    #[test]
    fn test_decode_error_changes_nothing() {
        let mut n = ready_negotiator();
        n.request_start(MeasurementType::Ecg, &[]).unwrap();
        assert!(n.handle_control_point(&[]).is_err());
        assert!(n.handle_control_point(&[0x55, 0x00]).is_err());
        assert!(n.handle_control_point(&[0xF0, 0x02, 0x04, 0x00]).is_err());
        assert_eq!(
            n.feature(MeasurementType::Ecg).unwrap().status(),
            FeatureStatus::StartPending
        );
        assert!(n.awaiting_ack());
        assert!(n.handle_control_point(&ECG_START_OK).is_ok());
        assert!(n.feature(MeasurementType::Ecg).unwrap().status().is_running());
    }

    #[test]
    fn test_timeout_retries_then_abandons() {
        let mut n = Negotiator::new(NegotiatorConfig {
            max_retries: 1,
            ..Default::default()
        });
        n.characteristic_ready();
        n.handle_control_point(&[0x0F, 0x01]).unwrap();
        n.handle_control_point(&ECG_SETTINGS).unwrap();
        n.request_start(MeasurementType::Ecg, &[]).unwrap();

        let step = n.ack_timed_out();
        assert_eq!(step.request, write(&[0x02, 0x00]));
        assert!(step.events.is_empty());

        let step = n.ack_timed_out();
        assert_eq!(step.request, None);
        assert_eq!(
            step.events,
            vec![NegotiationEvent::TimedOut {
                request: ControlRequest::Start {
                    measurement: MeasurementType::Ecg,
                    settings: vec![]
                }
            }]
        );
        assert_eq!(
            n.feature(MeasurementType::Ecg).unwrap().status(),
            FeatureStatus::Unacknowledged {
                operation: Operation::Start
            }
        );
        assert!(!n.awaiting_ack());
        // Not terminal
        assert!(n.request_start(MeasurementType::Ecg, &[]).is_ok());
    }

    #[test]
    fn test_disconnect_resets() {
        let mut n = ready_negotiator();
        n.request_start(MeasurementType::Ecg, &[]).unwrap();
        n.handle_control_point(&ECG_START_OK).unwrap();
        n.disconnect();
        assert!(n.support().is_none());
        assert_eq!(n.features().count(), 0);
        assert!(!n.awaiting_ack());
        assert!(matches!(
            n.decode_data(&ECG_FRAME),
            Err(PmdError::NotSupported(MeasurementType::Ecg))
        ));
    }

    /// Active settings exist exactly while a successful START has not been
    /// followed by a submitted STOP, for every interleaving of inputs.
    #[test]
    fn test_active_settings_track_running() {
        const ACTIONS: usize = 7;
        const DEPTH: u32 = 5;

        for seed in 0..ACTIONS.pow(DEPTH) {
            let mut n = Negotiator::new(NegotiatorConfig::default());
            n.characteristic_ready();
            n.handle_control_point(&[0x0F, 0x01]).unwrap();
            let mut started = false;
            let mut code = seed;

            for _ in 0..DEPTH {
                let action = code % ACTIONS;
                code /= ACTIONS;
                let step = match action {
                    0 => n.request_start(MeasurementType::Ecg, &[(SettingType::Resolution, 14)]),
                    1 => n.request_stop(MeasurementType::Ecg),
                    2 => n.handle_control_point(&ECG_START_OK),
                    3 => n.handle_control_point(&[0xF0, 0x02, 0x00, 0x06, 0x00]),
                    4 => n.handle_control_point(&ECG_STOP_OK),
                    5 => n.handle_control_point(&[0xF0, 0x03, 0x00, 0x06]),
                    _ => n.handle_control_point(&ECG_SETTINGS),
                };
                if let Ok(step) = step {
                    for event in &step.events {
                        match event {
                            NegotiationEvent::Started { .. } => started = true,
                            NegotiationEvent::Stopped { .. } => started = false,
                            _ => {}
                        }
                    }
                    if action == 1 {
                        started = false;
                    }
                }

                let ecg = n.feature(MeasurementType::Ecg).unwrap();
                assert_eq!(ecg.active_settings().is_some(), ecg.status().is_running());
                assert_eq!(ecg.active_settings().is_some(), started, "seed {seed}");
            }
        }
    }
}
