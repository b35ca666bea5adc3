//! State persistence and reconciliation.
//!
//! The registry is the single source of truth; the snapshot on disk is a
//! derived artifact that may lag. A whole-file JSON record is rewritten on
//! every mutation (temp-then-rename), and on startup the persisted view is
//! reconciled against live engine state before anything trusts it:
//! endpoints that no longer answer are omitted, instances the engines no
//! longer know are dropped with a warning.

use crate::config::TlsConfig;
use crate::engine::EngineConnector;
use crate::monitor::WatchEntry;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// No snapshot exists yet. Benign: treated as a first run.
    #[error("no snapshot found at {0}")]
    SnapshotNotFound(PathBuf),

    /// The snapshot exists but cannot be parsed. Fatal to load.
    #[error("snapshot is not valid JSON: {0}")]
    SnapshotParse(#[from] serde_json::Error),

    /// Filesystem failure. Non-fatal on save (logged by the caller).
    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Durable snapshot of the registry.
///
/// Serialized exactly as `{"servers":[...],"instances":{id: endpoint}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tracked endpoint identifiers.
    pub servers: Vec<String>,
    /// Instance id → owning endpoint identifier.
    pub instances: HashMap<String, String>,
}

impl Snapshot {
    /// Capture a point-in-time snapshot of the registry.
    pub async fn of_registry(registry: &Registry) -> Self {
        let mut servers = registry.endpoint_ids().await;
        servers.sort();
        Self {
            servers,
            instances: registry.instance_owners().await,
        }
    }
}

/// Whole-file snapshot store.
pub struct PersistenceStore {
    path: PathBuf,
}

impl PersistenceStore {
    /// Create a store writing to `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize the registry's current state to the store, overwriting
    /// atomically (write-temp-then-replace).
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] on filesystem failure. Callers log
    /// and continue; a save failure never blocks a deployment.
    pub async fn save(&self, registry: &Registry) -> Result<()> {
        let snapshot = Snapshot::of_registry(registry).await;
        self.write(&snapshot).await
    }

    /// Write a snapshot value directly.
    pub async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let data = serde_json::to_vec(snapshot)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(
            "Saved snapshot to {} ({} servers, {} instances)",
            self.path.display(),
            snapshot.servers.len(),
            snapshot.instances.len()
        );
        Ok(())
    }

    /// Read and parse the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::SnapshotNotFound`] when the file is
    /// absent (a benign "no prior state" signal),
    /// [`PersistenceError::SnapshotParse`] on malformed content, and
    /// [`PersistenceError::Io`] on any other read failure.
    pub async fn load(&self) -> Result<Snapshot> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::SnapshotNotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = serde_json::from_slice(&content)?;
        info!("Loaded snapshot from {}", self.path.display());
        Ok(snapshot)
    }

    /// Remove the on-disk snapshot. A missing file is not an error.
    pub async fn discard(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Discarded snapshot {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rebuild a registry from a snapshot, verifying against live engine state.
///
/// Best-effort and eventually consistent: endpoints that fail to reconnect
/// are omitted (their instances dropped), instances the engine no longer
/// knows are dropped, each with a logged warning. Never fails on partial
/// loss. Returns the watch entries to re-arm for the surviving instances.
pub async fn reconcile(
    snapshot: &Snapshot,
    connector: &dyn EngineConnector,
    tls: Option<&TlsConfig>,
    registry: &Registry,
) -> Vec<WatchEntry> {
    for endpoint in &snapshot.servers {
        match connector.connect(endpoint, tls).await {
            Ok(connection) => {
                registry.add_endpoint(endpoint, connection).await;
            }
            Err(e) => {
                warn!(
                    "Persisted endpoint {} failed to reconnect, omitting: {}",
                    endpoint, e
                );
            }
        }
    }

    let mut rearmed = Vec::new();

    for (instance_id, endpoint) in &snapshot.instances {
        let Some(connection) = registry.connection(endpoint).await else {
            warn!(
                "Dropping persisted instance {}: endpoint {} is gone",
                instance_id, endpoint
            );
            continue;
        };

        match connection.find(instance_id).await {
            Ok(Some(handle)) => match registry.add_instance(endpoint, handle).await {
                Ok(id) => rearmed.push(WatchEntry::new(endpoint.clone(), id)),
                Err(e) => warn!(
                    "Dropping persisted instance {}: re-registration failed: {}",
                    instance_id, e
                ),
            },
            Ok(None) => {
                warn!(
                    "Dropping persisted instance {}: no longer found on {}",
                    instance_id, endpoint
                );
            }
            Err(e) => {
                warn!(
                    "Dropping persisted instance {}: lookup on {} failed: {}",
                    instance_id, endpoint, e
                );
            }
        }
    }

    info!(
        "Reconciled snapshot: {} endpoints, {} instances survive",
        registry.endpoint_ids().await.len(),
        rearmed.len()
    );
    rearmed
}
