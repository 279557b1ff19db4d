//! Measurement collector.
//!
//! Gathers one reading from each registered sensor into a [`Snapshot`]. A
//! failed read leaves that metric absent and never aborts the round.

use std::time::Instant;

use tracing::{debug, warn};

use crate::config::TimestampMode;
use crate::identity::{DeviceIdentity, DeviceProfile};
use crate::sensors::{Metric, Sensor, SensorError};
use crate::snapshot::{Readings, Snapshot};

/// Collects snapshots from a fixed bank of sensors.
pub struct Collector {
    identity: DeviceIdentity,
    profile: DeviceProfile,
    sensors: Vec<(Metric, Box<dyn Sensor>)>,
    timestamp_mode: TimestampMode,
    boot: Instant,
}

impl Collector {
    /// Create a collector with no sensors registered.
    pub fn new(identity: DeviceIdentity, profile: DeviceProfile, timestamp_mode: TimestampMode) -> Self {
        Self {
            identity,
            profile,
            sensors: Vec::new(),
            timestamp_mode,
            boot: Instant::now(),
        }
    }

    /// Register the sensor that supplies `metric`, replacing any previous one.
    pub fn register(&mut self, metric: Metric, sensor: impl Sensor + 'static) -> &mut Self {
        self.sensors.retain(|(m, _)| *m != metric);
        self.sensors.push((metric, Box::new(sensor)));
        self
    }

    /// Builder-style variant of [`Collector::register`].
    pub fn with_sensor(mut self, metric: Metric, sensor: impl Sensor + 'static) -> Self {
        self.register(metric, sensor);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Number of registered sensors.
    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Read every sensor once and package the results.
    ///
    /// Metrics without a registered sensor are absent as well.
    pub fn collect(&mut self) -> Snapshot {
        let mut readings = Readings::default();

        for (metric, sensor) in self.sensors.iter_mut() {
            let result = sensor.read().and_then(|value| {
                if value.is_finite() {
                    Ok(value)
                } else {
                    Err(SensorError::InvalidReading(value))
                }
            });

            match result {
                Ok(value) => readings.set(*metric, Some(value)),
                Err(e) => {
                    warn!(metric = %metric, error = %e, "Sensor read failed, marking reading absent");
                    readings.set(*metric, None);
                }
            }
        }

        let timestamp = self.timestamp();
        debug!(
            timestamp = timestamp,
            present = readings.present_count(),
            total = Metric::all().len(),
            "Collected snapshot"
        );

        Snapshot::new(self.identity.as_str(), timestamp, self.profile.clone(), readings)
    }

    fn timestamp(&self) -> u64 {
        match self.timestamp_mode {
            TimestampMode::Uptime => self.boot.elapsed().as_millis() as u64,
            TimestampMode::Epoch => chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }
}
