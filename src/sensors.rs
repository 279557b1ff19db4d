//! Sensor collaborators for the measurement collector.
//!
//! Each physical sensor is exposed to the rest of the crate through the
//! [`Sensor`] trait: "read one typed measurement, or fail". The drivers
//! themselves live outside this crate; [`SimulatedSensor`] provides a
//! stand-in bank for host runs and tests.

use rand::Rng;

/// The fixed set of metrics carried by every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Temperature,
    Humidity,
    SoilMoisture,
    LightLevel,
    BatteryLevel,
}

impl Metric {
    /// Get all metrics in wire order.
    pub fn all() -> &'static [Metric] {
        &[
            Metric::Temperature,
            Metric::Humidity,
            Metric::SoilMoisture,
            Metric::LightLevel,
            Metric::BatteryLevel,
        ]
    }

    /// Get the metric name as it appears in the wire payload.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::SoilMoisture => "soil_moisture",
            Metric::LightLevel => "light_level",
            Metric::BatteryLevel => "battery_level",
        }
    }

    /// Get the unit for this metric.
    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Temperature => "celsius",
            _ => "percent",
        }
    }

    /// Physical range a healthy sensor reports for this metric.
    pub fn range(&self) -> (f64, f64) {
        match self {
            Metric::Temperature => (-10.0, 50.0),
            _ => (0.0, 100.0),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors a sensor read can fail with.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorError {
    /// The bus transaction failed (NACK, arbitration loss, ...)
    Bus(String),

    /// The sensor did not answer in time
    Timeout,

    /// The sensor answered with a value that is not a finite number
    InvalidReading(f64),
}

impl std::fmt::Display for SensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorError::Bus(e) => write!(f, "Sensor bus error: {}", e),
            SensorError::Timeout => write!(f, "Sensor read timed out"),
            SensorError::InvalidReading(v) => write!(f, "Sensor returned invalid reading: {}", v),
        }
    }
}

impl std::error::Error for SensorError {}

/// A single measurement source.
pub trait Sensor: Send {
    /// Read one measurement.
    fn read(&mut self) -> Result<f64, SensorError>;
}

/// Configuration for a simulated sensor.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Probability (0.0 - 1.0) that a read fails with a timeout
    pub fault_rate: f64,

    /// Largest change between two consecutive readings
    pub max_step: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fault_rate: 0.02,
            max_step: 1.5,
        }
    }
}

/// Simulated sensor producing a bounded random walk within the metric's range.
///
/// The battery gauge only ever drifts downwards, like a discharging cell.
pub struct SimulatedSensor {
    metric: Metric,
    value: f64,
    config: SimulationConfig,
}

impl SimulatedSensor {
    /// Create a simulated sensor starting from a plausible resting value.
    pub fn new(metric: Metric, config: SimulationConfig) -> Self {
        let value = match metric {
            Metric::Temperature => 21.0,
            Metric::Humidity => 45.0,
            Metric::SoilMoisture => 60.0,
            Metric::LightLevel => 50.0,
            Metric::BatteryLevel => 100.0,
        };

        Self {
            metric,
            value,
            config,
        }
    }

    /// Create one simulated sensor per metric with default settings.
    pub fn bank() -> Vec<(Metric, SimulatedSensor)> {
        Metric::all()
            .iter()
            .map(|&metric| (metric, SimulatedSensor::new(metric, SimulationConfig::default())))
            .collect()
    }

    /// The metric this sensor simulates.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn step(&self, rng: &mut impl Rng) -> f64 {
        if self.config.max_step <= 0.0 {
            return 0.0;
        }
        match self.metric {
            Metric::BatteryLevel => -rng.gen_range(0.0..self.config.max_step / 10.0),
            _ => rng.gen_range(-self.config.max_step..self.config.max_step),
        }
    }
}

impl Sensor for SimulatedSensor {
    fn read(&mut self) -> Result<f64, SensorError> {
        let mut rng = rand::thread_rng();

        if self.config.fault_rate > 0.0 && rng.gen_bool(self.config.fault_rate.min(1.0)) {
            return Err(SensorError::Timeout);
        }

        let (min, max) = self.metric.range();
        self.value = (self.value + self.step(&mut rng)).clamp(min, max);
        Ok(self.value)
    }
}
