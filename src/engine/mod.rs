//! Container engine abstraction layer.
//!
//! The fleet manager talks to remote container engines through the capability
//! traits defined here. The production implementation ([`docker`]) drives a
//! Docker daemon via the bollard API; test suites substitute doubles that
//! implement the same traits.
//!
//! ## Architecture
//!
//! - [`EngineConnector`]: opens a connection to one remote engine endpoint
//! - [`EngineConnection`]: verbs against a connected engine (run, find,
//!   stop, remove, health, logs)
//! - [`spec`]: deploy specification builder consumed by `run`
//! - [`docker`]: bollard-backed implementation (feature `docker`)

mod spec;

#[cfg(feature = "docker")]
mod docker;

#[cfg(test)]
pub(crate) mod fake;

pub use spec::{DeploySpec, DeploySpecBuilder, RestartPolicy};

#[cfg(feature = "docker")]
pub use docker::{DockerConnection, DockerEngine};

use crate::config::TlsConfig;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of raw log chunks from a container.
///
/// With `follow = false` the stream ends once buffered output is drained;
/// with `follow = true` it stays open until the container exits or the
/// consumer drops it.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opaque engine-side handle for a deployed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Engine-assigned instance identifier.
    pub id: String,
    /// Container name, when the engine reports one.
    pub name: Option<String>,
    /// Image the instance was created from, when known.
    pub image: Option<String>,
}

impl InstanceHandle {
    /// Create a handle from a bare identifier.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: None,
            image: None,
        }
    }
}

/// Health of a watched instance as reported by its engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// Health check grace period has not elapsed yet.
    Starting,
    /// Engine reports the instance healthy.
    Healthy,
    /// Engine reports the instance unhealthy.
    Unhealthy,
    /// The owning endpoint is unreachable.
    Unknown,
    /// The endpoint is reachable but the instance no longer exists there.
    NotFound,
    /// Any other engine-reported value, e.g. a raw container state string
    /// for images without a health check ("running", "exited", ...).
    Other(String),
}

impl HealthStatus {
    /// Map a raw engine-reported health string to a status.
    pub fn from_engine(raw: &str) -> Self {
        match raw {
            "starting" => Self::Starting,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
            Self::NotFound => write!(f, "not_found"),
            Self::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Why the engine rejected a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployErrorKind {
    /// The requested container name is already taken on that endpoint.
    NameInUse,
    /// A requested host port is already bound on that endpoint.
    PortAllocated,
    /// The image could not be found or pulled.
    ImageUnavailable,
    /// Anything else the engine refused.
    Other,
}

impl std::fmt::Display for DeployErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameInUse => write!(f, "name in use"),
            Self::PortAllocated => write!(f, "port already allocated"),
            Self::ImageUnavailable => write!(f, "image unavailable"),
            Self::Other => write!(f, "engine rejected deployment"),
        }
    }
}

/// Engine boundary errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Transport or auth failure reaching an endpoint. Fatal for that
    /// endpoint only.
    #[error("connection to endpoint {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The engine rejected container creation.
    #[error("deploy rejected ({kind}): {message}")]
    Deploy {
        kind: DeployErrorKind,
        message: String,
    },

    /// Invalid deploy specification.
    #[error("invalid deploy spec: {0}")]
    Spec(String),

    /// Engine API failure on an established connection.
    #[error("engine API error: {0}")]
    Api(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Opens connections to remote container engine endpoints.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    /// Connect to the engine at `endpoint` (a host/socket locator such as
    /// `10.0.0.5:2376`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Connect`] if the endpoint is unreachable or
    /// rejects the handshake.
    async fn connect(
        &self,
        endpoint: &str,
        tls: Option<&TlsConfig>,
    ) -> Result<Arc<dyn EngineConnection>>;
}

/// Verbs against one connected engine endpoint.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// Create and start a container from `spec`.
    async fn run(&self, spec: &DeploySpec) -> Result<InstanceHandle>;

    /// Look up an instance by id. `Ok(None)` means the endpoint is reachable
    /// but no such instance exists there.
    async fn find(&self, instance_id: &str) -> Result<Option<InstanceHandle>>;

    /// Stop a running instance.
    async fn stop(&self, instance_id: &str) -> Result<()>;

    /// Remove a stopped instance.
    async fn remove(&self, instance_id: &str) -> Result<()>;

    /// Read the instance's health attribute. Falls back to the raw container
    /// state for images without a health check.
    async fn health(&self, instance_id: &str) -> Result<HealthStatus>;

    /// Fetch instance logs, optionally following new output.
    async fn logs(&self, instance_id: &str, follow: bool) -> Result<LogStream>;
}

/// Generate a random 16-hex-character instance token, for engines that need
/// an identifier pre-assigned.
pub fn generate_instance_token() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
