//! Connection and instance registry.
//!
//! Thread-safe storage for the fleet's two long-lived maps: endpoint →
//! engine connection, and instance → (owning endpoint, handle). All
//! mutation goes through this type so the cascade rules and the locking
//! discipline live in one place.
//!
//! Locking discipline: when an operation needs both maps it acquires the
//! endpoint map first, then the instance map, and releases in reverse.
//! Engine calls (stop/remove) always happen outside both guards. Every
//! operation added here must preserve that order.

use crate::engine::{EngineConnection, EngineError, InstanceHandle, generate_instance_token};
use crate::monitor::WatchSet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Registry errors. Always surfaced to the caller, never retried.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Caller referenced an endpoint the registry does not track.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Caller referenced an instance the registry does not track.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// Upstream teardown failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Bookkeeping for one tracked instance.
#[derive(Clone)]
struct InstanceRecord {
    endpoint: String,
    handle: InstanceHandle,
}

/// The fleet's single source of truth for endpoints and instances.
pub struct Registry {
    endpoints: RwLock<HashMap<String, Arc<dyn EngineConnection>>>,
    instances: RwLock<HashMap<String, InstanceRecord>>,
    watches: WatchSet,
}

impl Registry {
    /// Create an empty registry sharing `watches` with the health monitor.
    pub fn new(watches: WatchSet) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            watches,
        }
    }

    /// Track an endpoint. Idempotent: re-adding an already-present id is a
    /// logged no-op and never replaces the active connection. Returns
    /// whether the endpoint was newly added.
    pub async fn add_endpoint(&self, id: &str, connection: Arc<dyn EngineConnection>) -> bool {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(id) {
            info!("Endpoint {} already tracked, keeping active connection", id);
            return false;
        }
        endpoints.insert(id.to_string(), connection);
        info!("Tracking endpoint {}", id);
        true
    }

    /// Drop an endpoint, tearing down every instance it owns first.
    ///
    /// The cascade is best-effort: a teardown failure on one instance is
    /// logged and does not abort removal of the others or of the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEndpoint`] if `id` is not tracked.
    pub async fn remove_endpoint(&self, id: &str) -> Result<()> {
        if !self.endpoints.read().await.contains_key(id) {
            return Err(RegistryError::UnknownEndpoint(id.to_string()));
        }

        // The cascade releases every guard while engine calls are in
        // flight, so a concurrent add_instance can land on the endpoint
        // mid-teardown. Loop until a sweep finds nothing owned, and make
        // the final emptiness check while holding the endpoint write
        // guard: add_instance needs the endpoint read lock, so nothing
        // can slip in between that check and the removal.
        loop {
            let owned: Vec<String> = self
                .instances
                .read()
                .await
                .iter()
                .filter(|(_, record)| record.endpoint == id)
                .map(|(instance_id, _)| instance_id.clone())
                .collect();

            if owned.is_empty() {
                // Endpoint map first, instance map second.
                let mut endpoints = self.endpoints.write().await;
                let instances = self.instances.read().await;
                if !instances.values().any(|record| record.endpoint == id) {
                    endpoints.remove(id);
                    break;
                }
                // A deploy landed while no guard was held; sweep again.
                continue;
            }

            for instance_id in owned {
                if let Err(e) = self.remove_instance(&instance_id).await {
                    warn!(
                        "Cascade teardown of instance {} on {} failed: {}",
                        instance_id, id, e
                    );
                    // An instance record must never outlive its endpoint.
                    self.instances.write().await.remove(&instance_id);
                    self.watches.unwatch(id, &instance_id).await;
                }
            }
        }

        info!("Dropped endpoint {}", id);
        Ok(())
    }

    /// Track a deployed instance under `endpoint`.
    ///
    /// The instance id is taken from the engine handle, or generated as a
    /// 16-hex token for engines that do not assign one.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEndpoint`] if `endpoint` is not
    /// tracked.
    pub async fn add_instance(&self, endpoint: &str, handle: InstanceHandle) -> Result<String> {
        let endpoints = self.endpoints.read().await;
        if !endpoints.contains_key(endpoint) {
            return Err(RegistryError::UnknownEndpoint(endpoint.to_string()));
        }

        let id = if handle.id.is_empty() {
            generate_instance_token()
        } else {
            handle.id.clone()
        };

        let mut instances = self.instances.write().await;
        instances.insert(
            id.clone(),
            InstanceRecord {
                endpoint: endpoint.to_string(),
                handle,
            },
        );
        drop(instances);
        drop(endpoints);

        info!("Tracking instance {} on {}", id, endpoint);
        Ok(id)
    }

    /// Tear down an instance: stop and remove it upstream, then delete its
    /// bookkeeping and unregister its watch entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownInstance`] if `id` is not tracked,
    /// or the engine error if upstream removal fails (the bookkeeping is
    /// kept in that case so the caller can retry).
    pub async fn remove_instance(&self, id: &str) -> Result<()> {
        let (endpoint, connection, _handle) = self.resolve(id).await?;

        // Engine calls stay outside the map guards.
        if let Err(e) = connection.stop(id).await {
            warn!("Failed to stop instance {} on {}: {}", id, endpoint, e);
        } else {
            info!("Stopped instance {} on {}", id, endpoint);
        }
        connection.remove(id).await?;
        info!("Removed instance {} on {}", id, endpoint);

        self.instances.write().await.remove(id);
        self.watches.unwatch(&endpoint, id).await;
        Ok(())
    }

    /// Look up an instance's owning endpoint, connection and handle.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownInstance`] if `id` is not tracked.
    pub async fn resolve(
        &self,
        id: &str,
    ) -> Result<(String, Arc<dyn EngineConnection>, InstanceHandle)> {
        let endpoints = self.endpoints.read().await;
        let instances = self.instances.read().await;

        let record = instances
            .get(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;

        // Invariant: an instance's owning endpoint is always tracked.
        let connection = endpoints
            .get(&record.endpoint)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownEndpoint(record.endpoint.clone()))?;

        Ok((record.endpoint.clone(), connection, record.handle.clone()))
    }

    /// The connection for an endpoint, if tracked.
    pub async fn connection(&self, endpoint: &str) -> Option<Arc<dyn EngineConnection>> {
        self.endpoints.read().await.get(endpoint).cloned()
    }

    /// Whether an endpoint is tracked.
    pub async fn contains_endpoint(&self, endpoint: &str) -> bool {
        self.endpoints.read().await.contains_key(endpoint)
    }

    /// Point-in-time copy of the tracked endpoint ids.
    pub async fn endpoint_ids(&self) -> Vec<String> {
        self.endpoints.read().await.keys().cloned().collect()
    }

    /// Point-in-time copy of the tracked instance ids.
    pub async fn instance_ids(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    /// Point-in-time copy of the instance → owning-endpoint mapping.
    pub async fn instance_owners(&self) -> HashMap<String, String> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.endpoint.clone()))
            .collect()
    }
}
