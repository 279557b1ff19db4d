//! Snapshot data model and wire encoding.
//!
//! A [`Snapshot`] is one sampling round across all monitored metrics. Failed
//! reads are carried as absent values and serialize as `null`, never as `0`.

use serde::{Serialize, Serializer};

use crate::identity::DeviceProfile;
use crate::sensors::Metric;

/// Round a reading to the two-decimal precision used on the wire.
pub fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn serialize_reading<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(v) => serializer.serialize_f64(round_two_decimals(*v)),
        None => serializer.serialize_none(),
    }
}

/// Per-metric values of one sampling round. `None` marks a failed read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Readings {
    #[serde(serialize_with = "serialize_reading")]
    temperature: Option<f64>,

    #[serde(serialize_with = "serialize_reading")]
    humidity: Option<f64>,

    #[serde(serialize_with = "serialize_reading")]
    soil_moisture: Option<f64>,

    #[serde(serialize_with = "serialize_reading")]
    light_level: Option<f64>,

    #[serde(serialize_with = "serialize_reading")]
    battery_level: Option<f64>,
}

impl Readings {
    /// Value recorded for a metric, if its read succeeded.
    pub fn get(&self, metric: Metric) -> Option<f64> {
        *self.slot(metric)
    }

    /// Record the outcome of a read.
    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        *self.slot_mut(metric) = value;
    }

    /// Whether the read for `metric` succeeded.
    pub fn is_present(&self, metric: Metric) -> bool {
        self.get(metric).is_some()
    }

    /// Number of metrics with a valid value.
    pub fn present_count(&self) -> usize {
        Metric::all().iter().filter(|m| self.is_present(**m)).count()
    }

    fn slot(&self, metric: Metric) -> &Option<f64> {
        match metric {
            Metric::Temperature => &self.temperature,
            Metric::Humidity => &self.humidity,
            Metric::SoilMoisture => &self.soil_moisture,
            Metric::LightLevel => &self.light_level,
            Metric::BatteryLevel => &self.battery_level,
        }
    }

    fn slot_mut(&mut self, metric: Metric) -> &mut Option<f64> {
        match metric {
            Metric::Temperature => &mut self.temperature,
            Metric::Humidity => &mut self.humidity,
            Metric::SoilMoisture => &mut self.soil_moisture,
            Metric::LightLevel => &mut self.light_level,
            Metric::BatteryLevel => &mut self.battery_level,
        }
    }
}

/// Error produced when a snapshot cannot be encoded.
#[derive(Debug)]
pub struct EncodeError(serde_json::Error);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to encode snapshot: {}", self.0)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// One immutable sampling round, tagged with the device identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    device_id: String,

    /// Milliseconds since boot or since the Unix epoch, depending on config
    timestamp: u64,

    #[serde(flatten)]
    profile: DeviceProfile,

    #[serde(flatten)]
    readings: Readings,
}

impl Snapshot {
    /// Create a snapshot from a completed sampling round.
    pub fn new(
        device_id: impl Into<String>,
        timestamp: u64,
        profile: DeviceProfile,
        readings: Readings,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            profile,
            readings,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn readings(&self) -> &Readings {
        &self.readings
    }

    /// Encode as the compact single-line JSON record sent on the wire and
    /// stored in the local cache.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(self).map_err(EncodeError)
    }
}
