//! Plant Telemetry - acquisition and delivery service for a plant monitor
//!
//! This service samples the plant sensors on a fixed interval, publishes each
//! snapshot to the backend, and caches snapshots locally while the backend is
//! unreachable. The backlog is drained in order once delivery succeeds again.
//!
//! ## Features
//!
//! - Persistent device identity and plant profile
//! - Durable bounded cache of undelivered snapshots
//! - Bounded reconnect attempts that never stall sampling
//! - Immediate sample on SIGUSR1 (stands in for the device button)
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `PLANT_TELEMETRY_API_URL`: Backend URL (default: http://localhost:8000)
//! - `PLANT_TELEMETRY_POLLING_INTERVAL_MS`: Milliseconds between ticks (default: 60000)
//! - `PLANT_TELEMETRY_MAX_RECONNECT_ATTEMPTS`: Reconnect budget (default: 3)
//! - `PLANT_TELEMETRY_CACHE_MAX_ENTRIES`: Cache entry bound (default: 500)
//! - `PLANT_TELEMETRY_CACHE_MAX_BYTES`: Cache byte bound (default: 262144)
//! - `PLANT_TELEMETRY_REQUEST_TIMEOUT_SECS`: Per-operation deadline (default: 10)
//! - `PLANT_TELEMETRY_DATA_DIR`: Storage and cache directory (default: ./plant_telemetry_data)
//! - `PLANT_TELEMETRY_TIMESTAMP`: `uptime` or `epoch` (default: uptime)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plant_telemetry::cache::{CacheConfig, LocalCache};
use plant_telemetry::collector::Collector;
use plant_telemetry::config::Config;
use plant_telemetry::delivery::{DeliveryLoop, LoopConfig, LoopEvent};
use plant_telemetry::identity::{DeviceProfile, IdentityOrigin, IdentityStore};
use plant_telemetry::sensors::SimulatedSensor;
use plant_telemetry::storage::{FileStore, KeyValueStore, MemoryStore, STORAGE_NAMESPACE};
use plant_telemetry::transport::HttpTransport;

/// Channel capacity for loop events
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Plant Telemetry service...");

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let store = open_store(&config);
    config.apply_stored_overrides(&store);
    info!(
        api_url = %config.api_url,
        polling_interval_ms = config.polling_interval.as_millis() as u64,
        max_reconnect_attempts = config.max_reconnect_attempts,
        timestamp_mode = ?config.timestamp_mode,
        "Configuration loaded"
    );

    let mut identities = IdentityStore::new(store.clone());
    let (identity, origin) = identities.get_or_create_with_origin();
    if let Some(IdentityOrigin::SessionOnly(e)) = origin {
        warn!(error = %e, "Device identity will change on next boot");
    }

    let profile = DeviceProfile::load(&store);
    if profile.is_empty() {
        info!("No plant profile configured");
    }

    let mut collector = Collector::new(identity.clone(), profile, config.timestamp_mode);
    for (metric, sensor) in SimulatedSensor::bank() {
        collector.register(metric, sensor);
    }
    info!(
        device_id = %identity,
        sensors = collector.sensor_count(),
        "Collector initialized"
    );

    let cache = LocalCache::open(
        config.cache_path(),
        CacheConfig::new(config.cache_max_entries, config.cache_max_bytes),
    );
    info!(
        cached = cache.len(),
        durable = cache.is_durable(),
        "Snapshot cache opened"
    );

    let transport = match HttpTransport::new(&config, &identity) {
        Ok(transport) => {
            info!(publish_url = %transport.publish_url(), "HTTP transport initialized");
            transport
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP transport");
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    spawn_shutdown_listener(tx.clone());
    spawn_sample_trigger(tx);

    info!("Plant Telemetry running. Press Ctrl+C to stop.");
    let mut delivery = DeliveryLoop::new(collector, transport, cache, LoopConfig::from(&config));
    let stats = delivery.run(rx).await;

    info!(
        ticks = stats.ticks,
        delivered = stats.delivered,
        cached = stats.cached,
        drained = stats.drained,
        dropped = stats.dropped,
        backlog = delivery.cache().len(),
        "Plant Telemetry stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Open the persistent store, falling back to a session-only store.
fn open_store(config: &Config) -> Arc<dyn KeyValueStore + Send + Sync> {
    let dir = config.data_dir.join(STORAGE_NAMESPACE);
    match FileStore::open(&dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                dir = %dir.display(),
                error = %e,
                "Persistent storage unavailable, settings will not survive restart"
            );
            Arc::new(MemoryStore::new())
        }
    }
}

fn spawn_shutdown_listener(tx: mpsc::Sender<LoopEvent>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = tx.send(LoopEvent::Shutdown).await;
    });
}

#[cfg(unix)]
fn spawn_sample_trigger(tx: mpsc::Sender<LoopEvent>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut trigger = match signal(SignalKind::user_defined1()) {
        Ok(trigger) => trigger,
        Err(e) => {
            warn!(error = %e, "Immediate sample trigger unavailable");
            return;
        }
    };

    tokio::spawn(async move {
        while trigger.recv().await.is_some() {
            // A full channel already holds a pending request
            if tx.try_send(LoopEvent::SampleNow).is_err() && tx.is_closed() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_sample_trigger(_tx: mpsc::Sender<LoopEvent>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_channel_capacity() {
        assert!(EVENT_CHANNEL_CAPACITY >= 2);
        assert!(EVENT_CHANNEL_CAPACITY <= 1024);
    }

    #[test]
    fn test_open_store_falls_back_to_memory() {
        // A regular file where the data directory should be
        let blocker = std::env::temp_dir().join(format!("plant-telemetry-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let config = Config {
            data_dir: blocker.clone(),
            ..Config::default()
        };
        let store = open_store(&config);
        store.set("uuid", b"abc".to_vec()).unwrap();
        assert_eq!(store.get("uuid"), Some(b"abc".to_vec()));

        std::fs::remove_file(&blocker).unwrap();
    }
}
