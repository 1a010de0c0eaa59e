//! One task per connected sensor.
//!
//! [`spawn_sensor`] moves a [`Negotiator`] into a tokio task and hands back a
//! cloneable [`SensorHandle`] plus a receiver of [`SensorUpdate`]s. The
//! transport layer feeds notifications in through the handle, in arrival
//! order, and receives the requests to perform through its
//! [`ControlTransport`]. Nothing is shared between sensors.
//!
//! ```ignore
//! let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
//! let (samples_tx, mut samples_rx) = mpsc::unbounded_channel::<SampleBatch>();
//! let (sensor, mut updates) = spawn_sensor(NegotiatorConfig::default(), transport_tx, samples_tx);
//!
//! sensor.characteristic_ready()?;
//! // ... forward control point and data notifications with
//! // sensor.control_point(bytes) / sensor.data(bytes)
//! sensor.start(MeasurementType::Ecg, None).await?;
//! ```

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::errors::{PmdError, Result};
use crate::negotiator::{
    FeatureStatus, NegotiationEvent, Negotiator, NegotiatorConfig, Step, TransportRequest,
};
use crate::registry::{MeasurementType, SettingType};
use crate::session::{SampleSink, StreamSession};

/// Performs control point I/O on behalf of a sensor task.
pub trait ControlTransport: Send + 'static {
    fn send(&mut self, request: TransportRequest) -> BoxFuture<'_, Result<()>>;
}

impl ControlTransport for mpsc::UnboundedSender<TransportRequest> {
    fn send(&mut self, request: TransportRequest) -> BoxFuture<'_, Result<()>> {
        let result = mpsc::UnboundedSender::send(self, request)
            .map_err(|_| PmdError::Transport("control point channel closed".into()));
        Box::pin(async move { result })
    }
}

/// Reported by a sensor task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "update", rename_all = "camelCase")]
pub enum SensorUpdate {
    Negotiation(NegotiationEvent),
    /// A notification that could not be used.
    Dropped {
        measurement: Option<MeasurementType>,
        error: String,
    },
    TransportFailed {
        error: String,
    },
    Disconnected,
}

enum SensorCommand {
    CharacteristicReady,
    ControlPoint(Vec<u8>),
    Data(Vec<u8>),
    Start {
        measurement: MeasurementType,
        settings: Option<Vec<(SettingType, u16)>>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        measurement: MeasurementType,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<Vec<(MeasurementType, FeatureStatus)>>,
    },
    Disconnected,
}

/// Cloneable handle to a sensor task.
#[derive(Debug, Clone)]
pub struct SensorHandle {
    commands: mpsc::UnboundedSender<SensorCommand>,
}

impl std::fmt::Debug for SensorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorCommand::CharacteristicReady => f.write_str("CharacteristicReady"),
            SensorCommand::ControlPoint(b) => write!(f, "ControlPoint({})", hex::encode(b)),
            SensorCommand::Data(b) => write!(f, "Data({} bytes)", b.len()),
            SensorCommand::Start { measurement, .. } => write!(f, "Start({measurement})"),
            SensorCommand::Stop { measurement, .. } => write!(f, "Stop({measurement})"),
            SensorCommand::Status { .. } => f.write_str("Status"),
            SensorCommand::Disconnected => f.write_str("Disconnected"),
        }
    }
}

impl SensorHandle {
    fn send(&self, command: SensorCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| PmdError::Closed)
    }

    /// GATT discovery finished; the task will read the feature bitmap.
    pub fn characteristic_ready(&self) -> Result<()> {
        self.send(SensorCommand::CharacteristicReady)
    }

    /// A control point notification or read result arrived.
    pub fn control_point(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.send(SensorCommand::ControlPoint(bytes.into()))
    }

    /// A data characteristic notification arrived.
    pub fn data(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.send(SensorCommand::Data(bytes.into()))
    }

    /// Submit a START. `None` picks the highest advertised value of every setting.
    ///
    /// Resolves once the request is queued, not when the sensor acknowledges
    /// it; watch for [`NegotiationEvent::Started`] for that.
    pub async fn start(
        &self,
        measurement: MeasurementType,
        settings: Option<Vec<(SettingType, u16)>>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SensorCommand::Start {
            measurement,
            settings,
            reply,
        })?;
        rx.await.map_err(|_| PmdError::Closed)?
    }

    pub async fn stop(&self, measurement: MeasurementType) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SensorCommand::Stop { measurement, reply })?;
        rx.await.map_err(|_| PmdError::Closed)?
    }

    /// Status of every measurement type the sensor supports.
    pub async fn status(&self) -> Result<Vec<(MeasurementType, FeatureStatus)>> {
        let (reply, rx) = oneshot::channel();
        self.send(SensorCommand::Status { reply })?;
        rx.await.map_err(|_| PmdError::Closed)
    }

    /// The link dropped. All negotiated state is discarded.
    pub fn disconnected(&self) -> Result<()> {
        self.send(SensorCommand::Disconnected)
    }
}

/// Spawn the task for one sensor on the current tokio runtime.
///
/// The task ends when every [`SensorHandle`] is dropped.
///
/// Updates go through a bounded channel of `config.event_buffer` slots and
/// must be drained: once it is full the task waits for room before handling
/// the next command. [`SensorUpdate::Dropped`] reports are the exception and
/// are discarded instead of waiting.
pub fn spawn_sensor<T, S>(
    config: NegotiatorConfig,
    transport: T,
    sink: S,
) -> (SensorHandle, mpsc::Receiver<SensorUpdate>)
where
    T: ControlTransport,
    S: SampleSink + 'static,
{
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (updates, update_rx) = mpsc::channel(config.event_buffer.max(1));

    let actor = SensorActor {
        negotiator: Negotiator::new(config),
        transport,
        sink,
        sessions: BTreeMap::new(),
        updates,
        deadline: None,
    };
    tokio::spawn(actor.run(command_rx));

    (SensorHandle { commands }, update_rx)
}

struct SensorActor<T, S> {
    negotiator: Negotiator,
    transport: T,
    sink: S,
    sessions: BTreeMap<MeasurementType, StreamSession>,
    updates: mpsc::Sender<SensorUpdate>,
    /// Acknowledgement deadline of the in-flight request.
    deadline: Option<Instant>,
}

impl<T: ControlTransport, S: SampleSink> SensorActor<T, S> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SensorCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = wait_for(self.deadline) => {
                    self.deadline = None;
                    let step = self.negotiator.ack_timed_out();
                    self.apply(step).await;
                }
            }
        }
        debug!("sensor task finished");
    }

    async fn handle(&mut self, command: SensorCommand) {
        debug!("sensor command: {command:?}");
        match command {
            SensorCommand::CharacteristicReady => {
                let step = self.negotiator.characteristic_ready();
                self.apply(step).await;
            }
            SensorCommand::ControlPoint(bytes) => match self.negotiator.handle_control_point(&bytes) {
                Ok(step) => self.apply(step).await,
                Err(e) => {
                    warn!("dropping control point notification {}: {e}", hex::encode(&bytes));
                    self.emit_dropped(None, e.to_string());
                }
            },
            SensorCommand::Data(payload) => self.on_data(&payload),
            SensorCommand::Start {
                measurement,
                settings,
                reply,
            } => {
                let result = match settings {
                    Some(settings) => Ok(settings),
                    None => self.negotiator.preferred_settings(measurement),
                }
                .and_then(|settings| self.negotiator.request_start(measurement, &settings));
                self.reply(result, reply).await;
            }
            SensorCommand::Stop { measurement, reply } => {
                let result = self.negotiator.request_stop(measurement);
                self.reply(result, reply).await;
            }
            SensorCommand::Status { reply } => {
                let status = self
                    .negotiator
                    .features()
                    .map(|f| (f.measurement(), f.status()))
                    .collect();
                let _ = reply.send(status);
            }
            SensorCommand::Disconnected => {
                self.negotiator.disconnect();
                self.sessions.clear();
                self.deadline = None;
                self.emit(SensorUpdate::Disconnected).await;
            }
        }
    }

    async fn reply(&mut self, result: Result<Step>, reply: oneshot::Sender<Result<()>>) {
        match result {
            Ok(step) => {
                let _ = reply.send(Ok(()));
                self.apply(step).await;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_data(&mut self, payload: &[u8]) {
        let measurement = payload
            .first()
            .and_then(|code| MeasurementType::from_code(*code).ok());
        let result = match measurement.and_then(|m| self.sessions.get_mut(&m)) {
            Some(session) => session
                .on_notification(&self.negotiator, payload, &mut self.sink)
                .map(|_| ()),
            // Reports why: not running, unsupported or malformed.
            None => self.negotiator.decode_data(payload).map(|_| ()),
        };
        if let Err(e) = result {
            debug!("dropping data notification: {e}");
            self.emit_dropped(measurement, e.to_string());
        }
    }

    async fn apply(&mut self, step: Step) {
        for event in step.events {
            match &event {
                NegotiationEvent::Started { measurement, .. } => {
                    match StreamSession::bind(&self.negotiator, *measurement) {
                        Ok(session) => {
                            info!("{measurement} streaming");
                            self.sessions.insert(*measurement, session);
                        }
                        Err(e) => warn!("cannot bind {measurement} session: {e}"),
                    }
                }
                NegotiationEvent::Stopped { measurement } => {
                    if let Some(session) = self.sessions.remove(measurement) {
                        info!(
                            "{measurement} stopped after {} frame(s), {} dropped",
                            session.frames(),
                            session.dropped()
                        );
                    }
                }
                _ => {}
            }
            self.emit(SensorUpdate::Negotiation(event)).await;
        }

        match step.request {
            Some(request) => {
                self.deadline = self
                    .negotiator
                    .config()
                    .ack_timeout
                    .map(|timeout| Instant::now() + timeout);
                if let Err(e) = self.transport.send(request).await {
                    warn!("control point request failed: {e}");
                    self.emit(SensorUpdate::TransportFailed {
                        error: e.to_string(),
                    })
                    .await;
                }
            }
            None if !self.negotiator.awaiting_ack() => self.deadline = None,
            None => {}
        }
    }

    async fn emit(&mut self, update: SensorUpdate) {
        if self.updates.send(update).await.is_err() {
            debug!("update receiver dropped");
        }
    }

    /// Like [`Self::emit`], but discards the update when the channel is full.
    fn emit_dropped(&self, measurement: Option<MeasurementType>, error: String) {
        match self.updates.try_send(SensorUpdate::Dropped { measurement, error }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("update channel full, discarding drop report");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("update receiver dropped"),
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
