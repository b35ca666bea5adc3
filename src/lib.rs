//! # Garrison
//!
//! A fleet manager for containerized game servers. Garrison maintains a
//! registry of container-engine endpoints and the server instances deployed
//! on them, places new deployments across the fleet, watches instance
//! health in the background, and persists its state so a restarted process
//! can pick up exactly where it left off.
//!
//! ## Architecture Overview
//!
//! The system consists of several components organized into modules:
//!
//! - **[`engine`]**: Container-engine abstraction with a Docker implementation
//! - **[`registry`]**: Endpoint and instance bookkeeping with cascade teardown
//! - **[`placement`]**: Host selection for new deployments
//! - **[`monitor`]**: Background health polling with change-only events
//! - **[`persistence`]**: Snapshot save/load and startup reconciliation
//! - **[`orchestrator`]**: The [`Garrison`] coordinator tying it all together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use garrison::{DeploySpec, FleetConfig, Garrison};
//! use garrison::engine::DockerEngine;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FleetConfig::from_file("garrison.toml").await?;
//!     let fleet = Garrison::new(config, Arc::new(DockerEngine::new())).await?;
//!
//!     let spec = DeploySpec::builder()
//!         .image("factorio:stable")
//!         .port("34197/udp", 34197)
//!         .build()?;
//!     let (host, instance) = fleet.deploy(&spec, None).await?;
//!     println!("Deployed {} on {}", instance, host);
//!
//!     fleet.shutdown(false).await;
//!     Ok(())
//! }
//! ```

/// Container-engine abstraction layer.
///
/// Defines the connector and connection capability traits plus deployment
/// specs, health status, and the engine error taxonomy. The Docker
/// implementation lives behind the `docker` feature.
pub mod engine;

/// Endpoint and instance registry.
///
/// Tracks engine endpoints and the instances deployed on them, with
/// ownership cascade on endpoint removal.
pub mod registry;

/// Deployment placement.
pub mod placement;

/// Background health monitoring.
///
/// Polls watched instances on a fixed period and emits change-only health
/// events onto a sentinel-terminated queue.
pub mod monitor;

/// State persistence and reconciliation.
///
/// Atomic JSON snapshots of the fleet plus a startup reconcile pass that
/// verifies persisted instances against live engine state.
pub mod persistence;

/// High-level fleet orchestration.
pub mod orchestrator;

/// Configuration loading.
pub mod config;

// Re-export engine types
pub use engine::{
    DeployErrorKind, DeploySpec, DeploySpecBuilder, EngineConnection, EngineConnector, EngineError,
    HealthStatus, InstanceHandle, RestartPolicy,
};

// Re-export registry and placement types
pub use placement::PlacementError;
pub use registry::{Registry, RegistryError};

// Re-export monitoring types
pub use monitor::{HealthEvent, HealthMonitor, WatchEntry};

// Re-export persistence types
pub use persistence::{PersistenceError, PersistenceStore, Snapshot};

// Re-export orchestration and config types
pub use config::{ConfigError, FleetConfig, TlsConfig};
pub use orchestrator::{Garrison, OrchestratorError};
