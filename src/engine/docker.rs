//! Docker engine implementation.
//!
//! Drives remote Docker daemons through the bollard API. One
//! [`DockerEngine`] connector produces one [`DockerConnection`] per
//! endpoint; connections map the engine capability verbs onto the
//! container API.

use crate::config::TlsConfig;
use crate::engine::{
    DeployErrorKind, DeploySpec, EngineConnection, EngineConnector, EngineError, HealthStatus,
    InstanceHandle, LogStream, Result,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::service::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection timeout in seconds for engine handshakes.
const CONNECT_TIMEOUT: u64 = 120;

/// Grace period in seconds before a stop escalates to SIGKILL.
const STOP_TIMEOUT: i64 = 10;

/// Connector for remote Docker endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerEngine;

impl DockerEngine {
    /// Create a new connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineConnector for DockerEngine {
    async fn connect(
        &self,
        endpoint: &str,
        tls: Option<&TlsConfig>,
    ) -> Result<Arc<dyn EngineConnection>> {
        let addr = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("tcp://{}", endpoint)
        };

        debug!("Connecting to engine at {}", addr);

        let docker = match tls {
            Some(tls) => Docker::connect_with_ssl(
                &addr,
                &tls.client_key,
                &tls.client_cert,
                &tls.ca_cert,
                CONNECT_TIMEOUT,
                bollard::API_DEFAULT_VERSION,
            ),
            None if addr.starts_with("unix://") => {
                Docker::connect_with_unix(&addr, CONNECT_TIMEOUT, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_http(&addr, CONNECT_TIMEOUT, bollard::API_DEFAULT_VERSION),
        }
        .map_err(|e| EngineError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        // Verify the daemon actually answers before handing out the
        // connection; bollard connects lazily.
        docker.ping().await.map_err(|e| EngineError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        info!("Connected to engine at {}", endpoint);

        Ok(Arc::new(DockerConnection { docker }))
    }
}

/// One connected Docker endpoint.
pub struct DockerConnection {
    docker: Docker,
}

impl DockerConnection {
    /// Wrap an already connected bollard client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Pull the image if it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Image {} already exists locally", image);
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(api_error(e)),
        }

        info!("Pulling image: {}", image);

        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(EngineError::Deploy {
                        kind: DeployErrorKind::ImageUnavailable,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }
}

#[async_trait]
impl EngineConnection for DockerConnection {
    async fn run(&self, spec: &DeploySpec) -> Result<InstanceHandle> {
        self.ensure_image(&spec.image).await?;

        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("garrison-{}", uuid::Uuid::new_v4()));

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|(container_port, host_port)| {
                (
                    container_port.clone(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy_name(spec.restart_policy)),
                maximum_retry_count: None,
            }),
            network_mode: Some(spec.network_mode.clone()),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let config = bollard::container::Config {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = bollard::container::CreateContainerOptions {
            name: name.as_str(),
            ..Default::default()
        };

        debug!("Creating container: {}", name);

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(deploy_error)?;

        self.docker
            .start_container(
                &response.id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await
            .map_err(deploy_error)?;

        info!(
            "Started container {} ({})",
            name,
            response.id.get(..12).unwrap_or(&response.id)
        );

        Ok(InstanceHandle {
            id: response.id,
            name: Some(name),
            image: Some(spec.image.clone()),
        })
    }

    async fn find(&self, instance_id: &str) -> Result<Option<InstanceHandle>> {
        match self
            .docker
            .inspect_container(
                instance_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
        {
            Ok(inspect) => Ok(Some(InstanceHandle {
                id: inspect.id.unwrap_or_else(|| instance_id.to_string()),
                name: inspect.name.map(|n| n.trim_start_matches('/').to_string()),
                image: inspect.config.and_then(|c| c.image),
            })),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        debug!("Stopping container: {}", instance_id);

        match self
            .docker
            .stop_container(
                instance_id,
                Some(bollard::container::StopContainerOptions { t: STOP_TIMEOUT }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        debug!("Removing container: {}", instance_id);

        self.docker
            .remove_container(
                instance_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(api_error)
    }

    async fn health(&self, instance_id: &str) -> Result<HealthStatus> {
        let inspect = match self
            .docker
            .inspect_container(
                instance_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
        {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(HealthStatus::NotFound),
            Err(e) => return Err(api_error(e)),
        };

        let state = match inspect.state {
            Some(state) => state,
            None => return Ok(HealthStatus::Unknown),
        };

        use bollard::models::HealthStatusEnum;

        match state.health.as_ref().and_then(|h| h.status) {
            Some(HealthStatusEnum::STARTING) => Ok(HealthStatus::Starting),
            Some(HealthStatusEnum::HEALTHY) => Ok(HealthStatus::Healthy),
            Some(HealthStatusEnum::UNHEALTHY) => Ok(HealthStatus::Unhealthy),
            // No health check configured; report the raw container state.
            _ => Ok(state
                .status
                .map(|s| HealthStatus::from_engine(&s.to_string()))
                .unwrap_or(HealthStatus::Unknown)),
        }
    }

    async fn logs(&self, instance_id: &str, follow: bool) -> Result<LogStream> {
        let stream = self.docker.logs(
            instance_id,
            Some(bollard::container::LogsOptions {
                stdout: true,
                stderr: true,
                follow,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        Ok(Box::pin(stream.map(|result| {
            result
                .map(|log| log.into_bytes().to_vec())
                .map_err(api_error)
        })))
    }
}

fn api_error(e: bollard::errors::Error) -> EngineError {
    EngineError::Api(e.to_string())
}

/// Translate an engine rejection into its deploy-error sub-kind.
fn deploy_error(e: bollard::errors::Error) -> EngineError {
    let (status_code, message) = match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => (*status_code, message.clone()),
        other => (0, other.to_string()),
    };

    let kind = classify_deploy_failure(status_code, &message);

    EngineError::Deploy { kind, message }
}

fn classify_deploy_failure(status_code: u16, message: &str) -> DeployErrorKind {
    if status_code == 409 || message.contains("is already in use") {
        DeployErrorKind::NameInUse
    } else if message.contains("port is already allocated") {
        DeployErrorKind::PortAllocated
    } else if message.contains("No such image") {
        DeployErrorKind::ImageUnavailable
    } else {
        DeployErrorKind::Other
    }
}

fn restart_policy_name(policy: crate::engine::RestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        crate::engine::RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        crate::engine::RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        crate::engine::RestartPolicy::No => RestartPolicyNameEnum::NO,
    }
}
