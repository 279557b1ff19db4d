//! Resilient delivery loop.
//!
//! Each tick collects a snapshot and either delivers it or caches it,
//! depending on connectivity. A live delivery success triggers a drain of
//! the cache backlog. Delivery failures feed a bounded reconnect counter:
//! while it is below the bound, a failed tick immediately attempts to
//! reconnect. Once it reaches the bound, the loop waits for the next natural
//! tick, which makes a single reconnect attempt before sampling.
//!
//! The loop is the only owner of its connectivity state and counter. Outside
//! requests (an immediate-read trigger, shutdown) reach it as [`LoopEvent`]s
//! on a single-consumer channel, so at most one tick ever runs at a time.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::{DeliverySink, DrainReport, LocalCache};
use crate::collector::Collector;
use crate::config::Config;
use crate::transport::{DeliveryError, Transport, TransportError};

/// Connectivity as last observed by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connected,
    Reconnecting,
}

/// Phase of the tick state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Sampling,
    Delivering,
    Caching,
    Reconnecting,
}

/// Requests delivered to a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// Run a tick now (e.g. button press). Coalesced with pending ticks.
    SampleNow,

    /// Stop after the current tick.
    Shutdown,
}

/// Timing and retry parameters of the loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between ticks, measured from tick start
    pub polling_interval: Duration,

    /// Reconnect attempts allowed before yielding to the next natural tick
    pub max_reconnect_attempts: u32,

    /// Deadline for a single connect or publish call
    pub operation_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(60),
            max_reconnect_attempts: 3,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for LoopConfig {
    fn from(config: &Config) -> Self {
        Self {
            polling_interval: config.polling_interval,
            max_reconnect_attempts: config.max_reconnect_attempts.max(1),
            operation_timeout: config.request_timeout,
        }
    }
}

/// Statistics about loop operations.
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    /// Ticks run, scheduled or requested
    pub ticks: u64,

    /// Immediate-read requests folded into another tick
    pub coalesced_requests: u64,

    /// Live snapshots delivered
    pub delivered: u64,

    /// Live snapshots cached
    pub cached: u64,

    /// Snapshots dropped after a fatal failure
    pub dropped: u64,

    /// Cached snapshots delivered by drains
    pub drained: u64,

    /// Connection attempts made
    pub reconnect_attempts: u64,

    /// Connection attempts that failed
    pub reconnect_failures: u64,
}

/// What a single tick did with its snapshot.
#[derive(Debug)]
pub enum TickOutcome {
    /// The live snapshot was delivered; `drain` reports the backlog flush
    Delivered { drain: DrainReport },

    /// The snapshot was cached. `reconnected` is the result of the
    /// immediate reconnect attempt, or `None` if the bound was reached.
    Cached { reconnected: Option<bool> },

    /// The snapshot could never be delivered and was discarded
    Dropped,
}

/// Publishes through a transport, treating an expired deadline as transient.
async fn publish_within<T: Transport>(
    transport: &mut T,
    payload: &[u8],
    deadline: Duration,
) -> Result<(), DeliveryError> {
    match timeout(deadline, transport.publish(payload)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Transient("deadline exceeded".to_string())),
    }
}

struct DeadlineSink<'a, T> {
    transport: &'a mut T,
    deadline: Duration,
}

impl<T: Transport> DeliverySink for DeadlineSink<'_, T> {
    async fn deliver(&mut self, payload: &[u8]) -> Result<(), DeliveryError> {
        publish_within(&mut *self.transport, payload, self.deadline).await
    }
}

/// The acquisition and delivery orchestrator.
pub struct DeliveryLoop<T> {
    collector: Collector,
    transport: T,
    cache: LocalCache,
    config: LoopConfig,
    connectivity: ConnectivityState,
    reconnect_attempts: u32,
    state: LoopState,
    stats: LoopStats,
}

impl<T: Transport> DeliveryLoop<T> {
    /// Create a loop. It starts disconnected; [`DeliveryLoop::run`] makes the
    /// first connection attempt.
    pub fn new(collector: Collector, transport: T, cache: LocalCache, config: LoopConfig) -> Self {
        Self {
            collector,
            transport,
            cache,
            config,
            connectivity: ConnectivityState::Disconnected,
            reconnect_attempts: 0,
            state: LoopState::Idle,
            stats: LoopStats::default(),
        }
    }

    /// Run until a [`LoopEvent::Shutdown`] arrives or the event channel closes.
    ///
    /// Ticks are scheduled from tick start; a tick that overruns the interval
    /// causes the missed ticks to be skipped rather than queued.
    pub async fn run(&mut self, mut events: mpsc::Receiver<LoopEvent>) -> LoopStats {
        info!(
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            max_reconnect_attempts = self.config.max_reconnect_attempts,
            cached = self.cache.len(),
            "Delivery loop started"
        );

        if self.connectivity != ConnectivityState::Connected {
            self.reconnect().await;
        }

        let mut ticker = interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;

                    if self.coalesce_pending(&mut events) {
                        break;
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(LoopEvent::SampleNow) => {
                            debug!("Immediate sample requested");
                            self.tick().await;
                            // The request stands in for the next scheduled tick
                            ticker.reset();

                            if self.coalesce_pending(&mut events) {
                                break;
                            }
                        }
                        Some(LoopEvent::Shutdown) | None => break,
                    }
                }
            }
        }

        self.transport.disconnect().await;
        self.connectivity = ConnectivityState::Disconnected;
        info!(
            ticks = self.stats.ticks,
            delivered = self.stats.delivered,
            cached = self.cache.len(),
            "Delivery loop stopped"
        );
        self.stats.clone()
    }

    /// Fold requests that queued up during a tick into that tick.
    /// Returns `true` if a shutdown was requested meanwhile.
    fn coalesce_pending(&mut self, events: &mut mpsc::Receiver<LoopEvent>) -> bool {
        loop {
            match events.try_recv() {
                Ok(LoopEvent::SampleNow) => self.stats.coalesced_requests += 1,
                Ok(LoopEvent::Shutdown) => return true,
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Run one full collect/deliver/cache/reconnect cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;

        // Outage outlasted the reconnect budget: one attempt per natural tick
        if self.connectivity != ConnectivityState::Connected
            && self.reconnect_attempts >= self.config.max_reconnect_attempts
        {
            self.reconnect().await;
        }

        self.set_state(LoopState::Sampling);
        let snapshot = self.collector.collect();

        let payload = match snapshot.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Dropping snapshot that cannot be encoded");
                return self.drop_snapshot();
            }
        };

        if self.connectivity == ConnectivityState::Connected {
            self.set_state(LoopState::Delivering);

            match publish_within(&mut self.transport, &payload, self.config.operation_timeout).await {
                Ok(()) => {
                    self.reconnect_attempts = 0;
                    self.stats.delivered += 1;
                    self.set_state(LoopState::Idle);
                    info!(timestamp = snapshot.timestamp(), "Delivered snapshot");

                    let drain = self.drain_backlog().await;
                    return TickOutcome::Delivered { drain };
                }
                Err(DeliveryError::Fatal(reason)) => {
                    error!(reason = %reason, "Snapshot rejected by endpoint, dropping it");
                    return self.drop_snapshot();
                }
                Err(e) => {
                    warn!(error = %e, "Delivery failed, caching snapshot");
                    self.mark_disconnected().await;
                }
            }
        }

        self.set_state(LoopState::Caching);
        match self.cache.append(payload) {
            Ok(_) => self.stats.cached += 1,
            Err(e) => {
                error!(error = %e, "Dropping snapshot that cannot be cached");
                return self.drop_snapshot();
            }
        }

        self.reconnect_attempts = (self.reconnect_attempts + 1).min(self.config.max_reconnect_attempts);
        debug!(
            attempts = self.reconnect_attempts,
            max_attempts = self.config.max_reconnect_attempts,
            cached = self.cache.len(),
            "Snapshot cached"
        );

        if self.reconnect_attempts < self.config.max_reconnect_attempts {
            let reconnected = self.reconnect().await;
            TickOutcome::Cached {
                reconnected: Some(reconnected),
            }
        } else {
            info!(
                attempts = self.reconnect_attempts,
                "Reconnect budget spent, waiting for next tick"
            );
            self.set_state(LoopState::Idle);
            TickOutcome::Cached { reconnected: None }
        }
    }

    /// Attempt to (re)establish the transport session.
    pub async fn reconnect(&mut self) -> bool {
        self.set_state(LoopState::Reconnecting);
        self.connectivity = ConnectivityState::Reconnecting;
        self.stats.reconnect_attempts += 1;

        let result = match timeout(self.config.operation_timeout, self.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        let connected = match result {
            Ok(()) => {
                self.connectivity = ConnectivityState::Connected;
                self.reconnect_attempts = 0;
                info!("Connectivity restored");
                true
            }
            Err(e) => {
                self.connectivity = ConnectivityState::Disconnected;
                self.stats.reconnect_failures += 1;
                warn!(
                    error = %e,
                    attempts = self.reconnect_attempts,
                    "Reconnect attempt failed"
                );
                false
            }
        };

        self.set_state(LoopState::Idle);
        connected
    }

    async fn drain_backlog(&mut self) -> DrainReport {
        if self.cache.is_empty() {
            return DrainReport::default();
        }

        let mut sink = DeadlineSink {
            transport: &mut self.transport,
            deadline: self.config.operation_timeout,
        };
        let report = self.cache.drain(&mut sink).await;
        self.stats.drained += report.delivered as u64;

        if let Some(e) = &report.stopped_by {
            warn!(error = %e, remaining = report.remaining, "Backlog drain interrupted");
            self.mark_disconnected().await;
        }
        report
    }

    async fn mark_disconnected(&mut self) {
        self.transport.disconnect().await;
        self.connectivity = ConnectivityState::Disconnected;
    }

    fn drop_snapshot(&mut self) -> TickOutcome {
        self.stats.dropped += 1;
        self.set_state(LoopState::Idle);
        TickOutcome::Dropped
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Loop state transition");
            self.state = state;
        }
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Current value of the bounded reconnect counter.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }
}
