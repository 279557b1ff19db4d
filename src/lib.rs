//! Plant Telemetry Library
//!
//! This library provides the acquisition and delivery loop of a
//! battery-powered plant monitor:
//!
//! - **config**: Environment-based configuration with stored overrides
//! - **storage**: Namespaced key-value persistence
//! - **identity**: Persistent device identity and plant profile
//! - **sensors**: Sensor trait and simulated sensor bank
//! - **snapshot**: Snapshot model and JSON wire encoding
//! - **collector**: One-round measurement collection
//! - **cache**: Bounded, durable FIFO of undelivered snapshots
//! - **transport**: Session-oriented publishing over HTTP
//! - **delivery**: The tick state machine with bounded reconnects
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use plant_telemetry::cache::{CacheConfig, LocalCache};
//! use plant_telemetry::collector::Collector;
//! use plant_telemetry::config::Config;
//! use plant_telemetry::delivery::{DeliveryLoop, LoopConfig, LoopEvent};
//! use plant_telemetry::identity::{DeviceProfile, IdentityStore};
//! use plant_telemetry::sensors::SimulatedSensor;
//! use plant_telemetry::storage::MemoryStore;
//! use plant_telemetry::transport::HttpTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let identity = IdentityStore::new(store.clone()).get_or_create();
//!     let profile = DeviceProfile::load(&store);
//!
//!     let mut collector = Collector::new(identity.clone(), profile, config.timestamp_mode);
//!     for (metric, sensor) in SimulatedSensor::bank() {
//!         collector.register(metric, sensor);
//!     }
//!
//!     let cache = LocalCache::open(
//!         config.cache_path(),
//!         CacheConfig::new(config.cache_max_entries, config.cache_max_bytes),
//!     );
//!     let transport = HttpTransport::new(&config, &identity).expect("Failed to create transport");
//!
//!     let (tx, rx) = tokio::sync::mpsc::channel(8);
//!     tx.send(LoopEvent::SampleNow).await.ok();
//!     tx.send(LoopEvent::Shutdown).await.ok();
//!
//!     let mut delivery = DeliveryLoop::new(collector, transport, cache, LoopConfig::from(&config));
//!     delivery.run(rx).await;
//! }
//! ```

pub mod cache;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod identity;
pub mod sensors;
pub mod snapshot;
pub mod storage;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use cache::{CacheConfig, CacheEntry, CacheError, CacheStats, DeliverySink, DrainReport, LocalCache};
pub use collector::Collector;
pub use config::{Config, ConfigError, TimestampMode};
pub use delivery::{
    ConnectivityState, DeliveryLoop, LoopConfig, LoopEvent, LoopState, LoopStats, TickOutcome,
};
pub use identity::{DeviceIdentity, DeviceProfile, IdentityOrigin, IdentityStore};
pub use sensors::{Metric, Sensor, SensorError, SimulatedSensor, SimulationConfig};
pub use snapshot::{EncodeError, Readings, Snapshot};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use transport::{DeliveryError, HttpTransport, Transport, TransportError};
