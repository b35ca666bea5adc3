//! Shared test fixtures: a scriptable in-memory container engine.

// Each test binary uses a different subset of the fixture API.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use garrison::engine::{
    DeployErrorKind, DeploySpec, EngineConnection, EngineConnector, EngineError, LogStream,
};
use garrison::{HealthStatus, InstanceHandle, TlsConfig};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

static INIT_TRACING: Once = Once::new();

/// Install the test log subscriber once per binary. Output is captured
/// per test; set RUST_LOG to adjust verbosity.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("garrison=debug")),
            )
            .with_test_writer()
            .init();
    });
}

/// A container engine made of scriptable in-memory hosts.
#[derive(Default)]
pub struct MockEngine {
    hosts: Mutex<HashMap<String, Arc<MockHost>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    /// Register a host and return its handle for scripting.
    pub async fn add_host(&self, endpoint: &str) -> Arc<MockHost> {
        let host = Arc::new(MockHost::default());
        self.hosts
            .lock()
            .await
            .insert(endpoint.to_string(), host.clone());
        host
    }

    pub async fn host(&self, endpoint: &str) -> Arc<MockHost> {
        self.hosts
            .lock()
            .await
            .get(endpoint)
            .cloned()
            .expect("host not registered")
    }

    pub async fn set_unreachable(&self, endpoint: &str) {
        self.unreachable.lock().await.insert(endpoint.to_string());
    }
}

#[async_trait]
impl EngineConnector for MockEngine {
    async fn connect(
        &self,
        endpoint: &str,
        _tls: Option<&TlsConfig>,
    ) -> Result<Arc<dyn EngineConnection>, EngineError> {
        if self.unreachable.lock().await.contains(endpoint) {
            return Err(EngineError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let host = self
            .hosts
            .lock()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| EngineError::Connect {
                endpoint: endpoint.to_string(),
                reason: "no route to host".to_string(),
            })?;

        Ok(host)
    }
}

#[derive(Clone)]
struct MockContainer {
    handle: InstanceHandle,
    health: HealthStatus,
}

/// One mock host: a container store plus deploy scripting.
#[derive(Default)]
pub struct MockHost {
    containers: Mutex<HashMap<String, MockContainer>>,
    reject_deploy: Mutex<Option<DeployErrorKind>>,
    deploy_seq: AtomicU64,
}

impl MockHost {
    pub async fn set_health(&self, id: &str, health: HealthStatus) {
        if let Some(container) = self.containers.lock().await.get_mut(id) {
            container.health = health;
        }
    }

    /// Remove a container without going through the fleet manager.
    pub async fn vanish(&self, id: &str) {
        self.containers.lock().await.remove(id);
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.containers.lock().await.contains_key(id)
    }

    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    /// The next `run` call fails with the given deploy error.
    pub async fn reject_next_deploy(&self, kind: DeployErrorKind) {
        *self.reject_deploy.lock().await = Some(kind);
    }
}

#[async_trait]
impl EngineConnection for MockHost {
    async fn run(&self, spec: &DeploySpec) -> Result<InstanceHandle, EngineError> {
        if let Some(kind) = self.reject_deploy.lock().await.take() {
            return Err(EngineError::Deploy {
                kind,
                message: "scripted deploy failure".to_string(),
            });
        }

        let seq = self.deploy_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{:012x}", seq + 1);
        let handle = InstanceHandle {
            id: id.clone(),
            name: spec.name.clone(),
            image: Some(spec.image.clone()),
        };

        self.containers.lock().await.insert(
            id,
            MockContainer {
                handle: handle.clone(),
                health: HealthStatus::Starting,
            },
        );

        Ok(handle)
    }

    async fn find(&self, instance_id: &str) -> Result<Option<InstanceHandle>, EngineError> {
        Ok(self
            .containers
            .lock()
            .await
            .get(instance_id)
            .map(|c| c.handle.clone()))
    }

    async fn stop(&self, _instance_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> Result<(), EngineError> {
        self.containers.lock().await.remove(instance_id);
        Ok(())
    }

    async fn health(&self, instance_id: &str) -> Result<HealthStatus, EngineError> {
        Ok(self
            .containers
            .lock()
            .await
            .get(instance_id)
            .map(|c| c.health.clone())
            .unwrap_or(HealthStatus::NotFound))
    }

    async fn logs(&self, instance_id: &str, _follow: bool) -> Result<LogStream, EngineError> {
        let line = format!("server {} listening\n", instance_id).into_bytes();
        Ok(Box::pin(stream::iter(vec![Ok(line)])))
    }
}
