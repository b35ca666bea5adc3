//! Fleet orchestrator.
//!
//! [`Garrison`] is the public-facing coordinator: it composes the registry,
//! placement, the health monitor and the persistence store into the
//! deploy/teardown/list/status/logs surface, drives a snapshot save after
//! every mutation and owns the monitor's lifecycle.

use crate::config::FleetConfig;
use crate::engine::{DeploySpec, EngineConnector, EngineError, HealthStatus, LogStream};
use crate::monitor::{HealthEvent, HealthMonitor};
use crate::persistence::{self, PersistenceError, PersistenceStore};
use crate::placement::{self, PlacementError};
use crate::registry::{Registry, RegistryError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Orchestrator errors: the union of the subsystem taxonomies.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The fleet manager.
///
/// Construction connects (or reconnects) the configured engine endpoints,
/// reconciles any prior snapshot against live engine state and starts the
/// health monitor. Background monitoring and persistence never fail a
/// caller; registry, placement and engine errors always surface.
pub struct Garrison {
    config: FleetConfig,
    connector: Arc<dyn EngineConnector>,
    registry: Arc<Registry>,
    monitor: HealthMonitor,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<UnboundedReceiver<HealthEvent>>>,
    store: PersistenceStore,
}

impl Garrison {
    /// Build a fleet manager.
    ///
    /// Attempts to reload prior state from the snapshot first; when none
    /// exists (first run) the configured endpoints are connected and an
    /// empty snapshot is written. Endpoints that fail to connect are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::SnapshotParse`] (or a non-benign IO
    /// failure) if a snapshot exists but cannot be read.
    pub async fn new(config: FleetConfig, connector: Arc<dyn EngineConnector>) -> Result<Self> {
        info!("Building fleet manager");

        let (monitor, events_rx) = HealthMonitor::new(config.poll_interval());
        let registry = Arc::new(Registry::new(monitor.watch_set()));
        let store = PersistenceStore::new(config.snapshot_path.clone());

        let orchestrator = Self {
            config,
            connector,
            registry,
            monitor,
            monitor_task: Mutex::new(None),
            events: Mutex::new(Some(events_rx)),
            store,
        };

        match orchestrator.store.load().await {
            Ok(snapshot) => {
                info!("Reloading prior state from persistent storage");
                let rearmed = persistence::reconcile(
                    &snapshot,
                    orchestrator.connector.as_ref(),
                    orchestrator.config.tls.as_ref(),
                    &orchestrator.registry,
                )
                .await;

                for endpoint in orchestrator.registry.endpoint_ids().await {
                    if let Some(connection) = orchestrator.registry.connection(&endpoint).await {
                        orchestrator.monitor.add_connection(&endpoint, connection).await;
                    }
                }
                for entry in rearmed {
                    orchestrator.monitor.watch(&entry.endpoint, &entry.instance).await;
                }
                orchestrator.save_quietly().await;
            }
            Err(PersistenceError::SnapshotNotFound(_)) => {
                info!("No previous state found, connecting configured endpoints");
                let endpoints = orchestrator.config.endpoints.clone();
                for endpoint in endpoints {
                    if let Err(e) = orchestrator.connect_endpoint(&endpoint).await {
                        warn!("Skipping endpoint {}: {}", endpoint, e);
                    }
                }
                orchestrator.save_quietly().await;
            }
            Err(e) => return Err(e.into()),
        }

        *orchestrator.monitor_task.lock().await = Some(orchestrator.monitor.spawn());
        info!("Fleet manager ready");
        Ok(orchestrator)
    }

    /// Deploy a game server onto `host`, or onto a randomly chosen
    /// endpoint when no host is given. Returns the chosen endpoint and the
    /// new instance id, which is immediately under health watch.
    ///
    /// # Errors
    ///
    /// Surfaces placement errors ([`PlacementError::UnknownEndpoint`],
    /// [`PlacementError::NoHostAvailable`]) and engine rejections
    /// ([`EngineError::Deploy`]).
    pub async fn deploy(
        &self,
        spec: &DeploySpec,
        host: Option<&str>,
    ) -> Result<(String, String)> {
        let endpoints = self.registry.endpoint_ids().await;
        let host = placement::choose(&endpoints, host)?;

        let connection = self
            .registry
            .connection(&host)
            .await
            .ok_or_else(|| RegistryError::UnknownEndpoint(host.clone()))?;

        let handle = connection.run(spec).await.map_err(|e| {
            error!("Deployment of {} on {} failed: {}", spec.image, host, e);
            e
        })?;

        let instance_id = self.registry.add_instance(&host, handle).await?;
        self.monitor.watch(&host, &instance_id).await;

        info!(
            "Deployed instance {} (image {}) on {}",
            instance_id, spec.image, host
        );
        self.save_quietly().await;

        Ok((host, instance_id))
    }

    /// Tear down an instance: unwatch it first so no health event can fire
    /// mid-removal, then stop and remove it upstream and drop it from the
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownInstance`] if `instance_id` is not
    /// tracked, or the engine error if upstream removal fails.
    pub async fn teardown(&self, instance_id: &str) -> Result<()> {
        let (endpoint, _connection, _handle) = self.registry.resolve(instance_id).await?;

        self.monitor.unwatch(&endpoint, instance_id).await;
        self.registry.remove_instance(instance_id).await?;
        self.save_quietly().await;
        Ok(())
    }

    /// Connect and track a new endpoint. Adding an already-tracked
    /// endpoint is a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Connect`] if the endpoint is unreachable.
    pub async fn add_endpoint(&self, endpoint: &str) -> Result<()> {
        if self.registry.contains_endpoint(endpoint).await {
            info!("Endpoint {} already tracked", endpoint);
            return Ok(());
        }
        self.connect_endpoint(endpoint).await?;
        self.save_quietly().await;
        Ok(())
    }

    /// Disconnect an endpoint, cascading teardown of every instance it
    /// owns.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEndpoint`] if `endpoint` is not
    /// tracked.
    pub async fn remove_endpoint(&self, endpoint: &str) -> Result<()> {
        self.registry.remove_endpoint(endpoint).await?;
        self.monitor.disconnect(endpoint).await;
        self.save_quietly().await;
        Ok(())
    }

    /// Point-in-time copy of the tracked endpoint identifiers.
    pub async fn list_endpoints(&self) -> Vec<String> {
        self.registry.endpoint_ids().await
    }

    /// Point-in-time copy of the tracked instance identifiers.
    pub async fn list_instances(&self) -> Vec<String> {
        self.registry.instance_ids().await
    }

    /// Query an instance's current health from its engine. Falls back to
    /// the raw container state for images without a health check.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownInstance`] if `instance_id` is not
    /// tracked.
    pub async fn status(&self, instance_id: &str) -> Result<HealthStatus> {
        let (_endpoint, connection, _handle) = self.registry.resolve(instance_id).await?;
        Ok(connection.health(instance_id).await?)
    }

    /// Fetch an instance's logs, optionally following new output.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownInstance`] if `instance_id` is not
    /// tracked.
    pub async fn logs(&self, instance_id: &str, follow: bool) -> Result<LogStream> {
        let (_endpoint, connection, _handle) = self.registry.resolve(instance_id).await?;
        Ok(connection.logs(instance_id, follow).await?)
    }

    /// Take the health event receiver. The queue supports a single
    /// consumer: the first call returns it, later calls return `None`.
    pub async fn subscribe(&self) -> Option<UnboundedReceiver<HealthEvent>> {
        self.events.lock().await.take()
    }

    /// Stop the health monitor and wait for it to finish. After this
    /// returns, the [`HealthEvent::Shutdown`] sentinel is the last item on
    /// the event queue. With `discard_state` the on-disk snapshot is
    /// removed as well (deliberate full shutdown).
    pub async fn shutdown(&self, discard_state: bool) {
        info!("Shutting down fleet manager");
        self.monitor.stop();

        if let Some(task) = self.monitor_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Health monitor task ended abnormally: {}", e);
            }
        }

        if discard_state {
            if let Err(e) = self.store.discard().await {
                error!("Failed to discard snapshot: {}", e);
            }
        }
    }

    async fn connect_endpoint(&self, endpoint: &str) -> Result<()> {
        let connection = self
            .connector
            .connect(endpoint, self.config.tls.as_ref())
            .await?;
        self.registry.add_endpoint(endpoint, connection.clone()).await;
        self.monitor.add_connection(endpoint, connection).await;
        Ok(())
    }

    /// Save the snapshot, logging and swallowing failures: the registry
    /// mutation already committed and persistence must never block it.
    async fn save_quietly(&self) {
        if let Err(e) = self.store.save(&self.registry).await {
            error!("Failed to save state: {}", e);
        }
    }
}
