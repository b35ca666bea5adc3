//! In-memory engine double for unit tests.

use crate::config::TlsConfig;
use crate::engine::{
    DeployErrorKind, DeploySpec, EngineConnection, EngineConnector, EngineError, HealthStatus,
    InstanceHandle, LogStream, Result, generate_instance_token,
};
use async_trait::async_trait;
use futures::stream;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Scriptable engine connector: a fixed set of endpoints, each backed by a
/// [`FakeConnection`], with per-endpoint reachability toggles.
#[derive(Default)]
pub(crate) struct FakeEngine {
    connections: Mutex<HashMap<String, Arc<FakeConnection>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and return its backing connection for scripting.
    pub(crate) async fn add_endpoint(&self, endpoint: &str) -> Arc<FakeConnection> {
        let conn = Arc::new(FakeConnection::default());
        self.connections
            .lock()
            .await
            .insert(endpoint.to_string(), conn.clone());
        conn
    }

    pub(crate) async fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }
}

#[async_trait]
impl EngineConnector for FakeEngine {
    async fn connect(
        &self,
        endpoint: &str,
        _tls: Option<&TlsConfig>,
    ) -> Result<Arc<dyn EngineConnection>> {
        if self.unreachable.lock().await.contains(endpoint) {
            return Err(EngineError::Connect {
                endpoint: endpoint.to_string(),
                reason: "endpoint marked unreachable".to_string(),
            });
        }

        let conn = self
            .connections
            .lock()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| EngineError::Connect {
                endpoint: endpoint.to_string(),
                reason: "unknown endpoint".to_string(),
            })?;

        Ok(conn)
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    handle: InstanceHandle,
    health: HealthStatus,
}

/// Parks the next removal so a test can interleave other operations while
/// the engine call is in flight.
pub(crate) struct RemovalGate {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl RemovalGate {
    /// Wait until the gated removal is parked inside the engine call.
    pub(crate) async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the parked removal proceed.
    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

/// One fake endpoint's container store.
#[derive(Default)]
pub(crate) struct FakeConnection {
    containers: Mutex<HashMap<String, FakeContainer>>,
    reject_deploy: Mutex<Option<DeployErrorKind>>,
    remove_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeConnection {
    /// Pre-seed a container, as if deployed in a previous process lifetime.
    pub(crate) async fn seed(&self, id: &str, health: HealthStatus) {
        self.containers.lock().await.insert(
            id.to_string(),
            FakeContainer {
                handle: InstanceHandle::new(id),
                health,
            },
        );
    }

    pub(crate) async fn set_health(&self, id: &str, health: HealthStatus) {
        if let Some(container) = self.containers.lock().await.get_mut(id) {
            container.health = health;
        }
    }

    /// Drop a container behind the registry's back.
    pub(crate) async fn vanish(&self, id: &str) {
        self.containers.lock().await.remove(id);
    }

    pub(crate) async fn contains(&self, id: &str) -> bool {
        self.containers.lock().await.contains_key(id)
    }

    pub(crate) async fn reject_next_deploy(&self, kind: DeployErrorKind) {
        *self.reject_deploy.lock().await = Some(kind);
    }

    /// Arm a gate on the next `remove` call.
    pub(crate) async fn hold_next_removal(&self) -> RemovalGate {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.remove_gate.lock().await = Some((reached.clone(), release.clone()));
        RemovalGate { reached, release }
    }
}

#[async_trait]
impl EngineConnection for FakeConnection {
    async fn run(&self, spec: &DeploySpec) -> Result<InstanceHandle> {
        if let Some(kind) = self.reject_deploy.lock().await.take() {
            return Err(EngineError::Deploy {
                kind,
                message: "scripted rejection".to_string(),
            });
        }

        let id = generate_instance_token();
        let handle = InstanceHandle {
            id: id.clone(),
            name: spec.name.clone(),
            image: Some(spec.image.clone()),
        };

        self.containers.lock().await.insert(
            id,
            FakeContainer {
                handle: handle.clone(),
                health: HealthStatus::Starting,
            },
        );

        Ok(handle)
    }

    async fn find(&self, instance_id: &str) -> Result<Option<InstanceHandle>> {
        Ok(self
            .containers
            .lock()
            .await
            .get(instance_id)
            .map(|c| c.handle.clone()))
    }

    async fn stop(&self, _instance_id: &str) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        if let Some((reached, release)) = self.remove_gate.lock().await.take() {
            reached.notify_one();
            release.notified().await;
        }
        self.containers.lock().await.remove(instance_id);
        Ok(())
    }

    async fn health(&self, instance_id: &str) -> Result<HealthStatus> {
        Ok(self
            .containers
            .lock()
            .await
            .get(instance_id)
            .map(|c| c.health.clone())
            .unwrap_or(HealthStatus::NotFound))
    }

    async fn logs(&self, instance_id: &str, _follow: bool) -> Result<LogStream> {
        let line = format!("[fake] logs for {}\n", instance_id).into_bytes();
        Ok(Box::pin(stream::iter(vec![Ok(line)])))
    }
}
