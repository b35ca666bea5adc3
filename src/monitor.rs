//! Health-monitoring daemon.
//!
//! A single background task polls every watched (endpoint, instance) pair
//! once per cycle, reads its health through the owning endpoint's engine
//! connection, and pushes change-only events to an unbounded queue. The
//! queue is terminated by exactly one [`HealthEvent::Shutdown`] sentinel
//! once the task exits.
//!
//! The monitor keeps its own mirror of the endpoint connections so a poll
//! sweep never contends with registry mutation; callers keep the mirror
//! current through [`HealthMonitor::add_connection`] /
//! [`HealthMonitor::disconnect`].

use crate::engine::{EngineConnection, HealthStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One (endpoint, instance) pair under active health observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEntry {
    /// Owning endpoint identifier.
    pub endpoint: String,
    /// Watched instance identifier.
    pub instance: String,
}

impl WatchEntry {
    /// Create a watch entry.
    pub fn new<E: Into<String>, I: Into<String>>(endpoint: E, instance: I) -> Self {
        Self {
            endpoint: endpoint.into(),
            instance: instance.into(),
        }
    }
}

impl std::fmt::Display for WatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.instance)
    }
}

/// Item on the monitor's output queue.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A watched pair's health changed since the last observation.
    Status {
        entry: WatchEntry,
        status: HealthStatus,
    },
    /// Terminal sentinel: the monitor task has exited and no further
    /// events will arrive.
    Shutdown,
}

/// The set of watched pairs, guarded by its own dedicated lock.
///
/// Mutated by caller tasks (watch/unwatch, registry cascade removal) and
/// snapshotted by the monitor loop once per cycle. Clones share storage.
#[derive(Clone, Default)]
pub struct WatchSet {
    entries: Arc<Mutex<Vec<WatchEntry>>>,
}

impl WatchSet {
    /// Create an empty watch set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair. Returns `false` if it was already watched.
    pub async fn watch(&self, endpoint: &str, instance: &str) -> bool {
        let entry = WatchEntry::new(endpoint, instance);
        let mut entries = self.entries.lock().await;
        if entries.contains(&entry) {
            return false;
        }
        info!("Now watching {}", entry);
        entries.push(entry);
        true
    }

    /// Remove a pair. Returns `false` if it was not watched.
    pub async fn unwatch(&self, endpoint: &str, instance: &str) -> bool {
        let entry = WatchEntry::new(endpoint, instance);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e != &entry);
        if entries.len() == before {
            return false;
        }
        info!("No longer watching {}", entry);
        true
    }

    /// Point-in-time copy of the watched pairs, in watch order.
    pub async fn snapshot(&self) -> Vec<WatchEntry> {
        self.entries.lock().await.clone()
    }
}

/// Background health-monitoring daemon.
///
/// Cheap to clone; clones share the watch set, the connection mirror and
/// the stop flag, so any clone can act as a control handle for the single
/// spawned poll loop.
#[derive(Clone)]
pub struct HealthMonitor {
    connections: Arc<RwLock<HashMap<String, Arc<dyn EngineConnection>>>>,
    watches: WatchSet,
    events_tx: UnboundedSender<HealthEvent>,
    running: Arc<AtomicBool>,
    period: Duration,
}

impl HealthMonitor {
    /// Create a monitor and the receiving end of its event queue.
    pub fn new(period: Duration) -> (Self, UnboundedReceiver<HealthEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        let monitor = Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            watches: WatchSet::new(),
            events_tx,
            running: Arc::new(AtomicBool::new(false)),
            period,
        };
        debug!("Built health monitor (period {:?})", period);
        (monitor, events_rx)
    }

    /// The shared watch set. The registry holds a clone so watch removal is
    /// synchronous with instance removal.
    pub fn watch_set(&self) -> WatchSet {
        self.watches.clone()
    }

    /// Mirror a registry endpoint addition.
    pub async fn add_connection(&self, endpoint: &str, connection: Arc<dyn EngineConnection>) {
        self.connections
            .write()
            .await
            .insert(endpoint.to_string(), connection);
        info!("Monitor added connection to {}", endpoint);
    }

    /// Mirror a registry endpoint removal.
    pub async fn disconnect(&self, endpoint: &str) {
        if self.connections.write().await.remove(endpoint).is_none() {
            warn!("Monitor had no connection to {}", endpoint);
            return;
        }
        info!("Monitor disconnected from {}", endpoint);
    }

    /// Start watching a pair. Returns whether the set changed.
    pub async fn watch(&self, endpoint: &str, instance: &str) -> bool {
        self.watches.watch(endpoint, instance).await
    }

    /// Stop watching a pair. Returns whether the set changed.
    pub async fn unwatch(&self, endpoint: &str, instance: &str) -> bool {
        self.watches.unwatch(endpoint, instance).await
    }

    /// Request a cooperative stop, observed at the top of the next cycle.
    /// Join the handle returned by [`spawn`](Self::spawn) before trusting
    /// the [`HealthEvent::Shutdown`] sentinel to be the last queue item.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawn the poll loop. The task runs until [`stop`](Self::stop) and
    /// enqueues the shutdown sentinel as its final action.
    pub fn spawn(&self) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run().await })
    }

    async fn run(self) {
        info!("Health check loop begins");
        let mut last_known: HashMap<WatchEntry, HealthStatus> = HashMap::new();

        while self.running.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();

            for entry in self.watches.snapshot().await {
                self.check_instance(&entry, &mut last_known).await;
            }

            let elapsed = cycle_start.elapsed();
            if elapsed < self.period {
                tokio::time::sleep(self.period - elapsed).await;
            }
            // A slow cycle proceeds immediately; cycles are never queued up.
        }

        info!("Health check loop exiting");
        let _ = self.events_tx.send(HealthEvent::Shutdown);
    }

    /// Poll one watched pair and emit its status if it changed.
    async fn check_instance(
        &self,
        entry: &WatchEntry,
        last_known: &mut HashMap<WatchEntry, HealthStatus>,
    ) {
        let connection = self.connections.read().await.get(&entry.endpoint).cloned();

        let Some(connection) = connection else {
            // Endpoint lost. Emit Unknown once, and only if some status was
            // previously observed for this pair.
            self.transition_to_unknown(entry, last_known);
            return;
        };

        let found = match connection.find(&entry.instance).await {
            Ok(found) => found,
            Err(e) => {
                debug!("Instance lookup for {} failed: {}", entry, e);
                self.transition_to_unknown(entry, last_known);
                return;
            }
        };

        if found.is_none() {
            // Instance vanished while its endpoint stayed reachable.
            if last_known.get(entry) != Some(&HealthStatus::NotFound) {
                last_known.insert(entry.clone(), HealthStatus::NotFound);
                self.emit(entry, HealthStatus::NotFound);
            }
            return;
        }

        let status = match connection.health(&entry.instance).await {
            Ok(status) => status,
            Err(e) => {
                debug!("Health read for {} failed: {}", entry, e);
                self.transition_to_unknown(entry, last_known);
                return;
            }
        };

        if last_known.get(entry) != Some(&status) {
            last_known.insert(entry.clone(), status.clone());
            self.emit(entry, status);
        }
    }

    fn transition_to_unknown(
        &self,
        entry: &WatchEntry,
        last_known: &mut HashMap<WatchEntry, HealthStatus>,
    ) {
        match last_known.get(entry) {
            Some(previous) if *previous != HealthStatus::Unknown => {
                last_known.insert(entry.clone(), HealthStatus::Unknown);
                self.emit(entry, HealthStatus::Unknown);
            }
            _ => {}
        }
    }

    fn emit(&self, entry: &WatchEntry, status: HealthStatus) {
        debug!("Health change for {}: {}", entry, status);
        let _ = self.events_tx.send(HealthEvent::Status {
            entry: entry.clone(),
            status,
        });
    }
}
