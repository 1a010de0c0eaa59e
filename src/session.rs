//! Forwarding decoded samples of a running stream to a sink.

use log::{trace, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::errors::{PmdError, Result};
use crate::frame::{decode_frame, Samples};
use crate::negotiator::Negotiator;
use crate::registry::{ActiveSettings, MeasurementType};

/// Receives every successfully decoded frame.
pub trait SampleSink: Send {
    fn on_samples(&mut self, measurement: MeasurementType, samples: &Samples, settings: &ActiveSettings);
}

impl<F> SampleSink for F
where
    F: FnMut(MeasurementType, &Samples, &ActiveSettings) + Send,
{
    fn on_samples(&mut self, measurement: MeasurementType, samples: &Samples, settings: &ActiveSettings) {
        self(measurement, samples, settings)
    }
}

impl SampleSink for mpsc::UnboundedSender<SampleBatch> {
    fn on_samples(&mut self, measurement: MeasurementType, samples: &Samples, settings: &ActiveSettings) {
        if self
            .send(SampleBatch::new(measurement, samples, settings))
            .is_err()
        {
            trace!("sample receiver dropped, discarding {measurement} batch");
        }
    }
}

/// Owned copy of one frame's samples, in the shape downstream consumers expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleBatch {
    pub measurement: MeasurementType,
    /// 1-tuples for single channel streams, 3-tuples for x/y/z.
    pub samples: Vec<Vec<f64>>,
    pub settings: ActiveSettings,
}

impl SampleBatch {
    pub fn new(measurement: MeasurementType, samples: &Samples, settings: &ActiveSettings) -> Self {
        Self {
            measurement,
            samples: samples.to_tuples(),
            settings: settings.clone(),
        }
    }
}

/// Binds one running measurement type to the frame decoder.
#[derive(Debug, Clone)]
pub struct StreamSession {
    measurement: MeasurementType,
    frames: u64,
    dropped: u64,
}

impl StreamSession {
    /// Fails unless `measurement` is currently running on `negotiator`.
    pub fn bind(negotiator: &Negotiator, measurement: MeasurementType) -> Result<Self> {
        let feature = negotiator
            .feature(measurement)
            .ok_or(PmdError::NotSupported(measurement))?;
        if !feature.status().is_running() {
            return Err(PmdError::NotRunning {
                measurement,
                status: feature.status(),
            });
        }
        Ok(Self {
            measurement,
            frames: 0,
            dropped: 0,
        })
    }

    pub fn measurement(&self) -> MeasurementType {
        self.measurement
    }

    /// Frames forwarded to the sink.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Notifications dropped because they could not be decoded.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Whether a data notification belongs to this stream.
    pub fn accepts(&self, payload: &[u8]) -> bool {
        payload.first() == Some(&self.measurement.code())
    }

    /// Decode one notification and forward it. Returns the number of samples.
    ///
    /// On error nothing reaches the sink and the drop counter is bumped.
    pub fn on_notification(
        &mut self,
        negotiator: &Negotiator,
        payload: &[u8],
        sink: &mut dyn SampleSink,
    ) -> Result<usize> {
        match self.decode(negotiator, payload) {
            Ok((samples, settings)) => {
                sink.on_samples(self.measurement, &samples, settings);
                self.frames += 1;
                Ok(samples.len())
            }
            Err(e) => {
                self.dropped += 1;
                warn!("{}: dropping notification: {e}", self.measurement);
                Err(e)
            }
        }
    }

    fn decode<'n>(
        &self,
        negotiator: &'n Negotiator,
        payload: &[u8],
    ) -> Result<(Samples, &'n ActiveSettings)> {
        let feature = negotiator
            .feature(self.measurement)
            .ok_or(PmdError::NotSupported(self.measurement))?;
        let settings = feature.active_settings().ok_or(PmdError::NotRunning {
            measurement: self.measurement,
            status: feature.status(),
        })?;
        let frame = decode_frame(payload, settings)?;
        if frame.measurement != self.measurement {
            return Err(PmdError::WrongStream {
                expected: self.measurement,
                got: frame.measurement,
            });
        }
        Ok((frame.samples, settings))
    }
}
