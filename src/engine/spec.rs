//! Deploy specification builder.
//!
//! Provides a fluent API for describing a game-server deployment
//! programmatically: image, container name, environment, port forwards
//! and restart behavior.

use crate::engine::{EngineError, Result};
use std::collections::HashMap;

/// Restart behavior applied to deployed instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Always restart the container when it exits.
    #[default]
    Always,
    /// Restart only on non-zero exit.
    OnFailure,
    /// Never restart.
    No,
}

impl RestartPolicy {
    /// Engine wire name for the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::No => "no",
        }
    }
}

/// Deploy specification builder.
#[derive(Debug, Default)]
pub struct DeploySpecBuilder {
    image: Option<String>,
    name: Option<String>,
    env: Vec<String>,
    ports: HashMap<String, u16>,
    restart_policy: RestartPolicy,
    network_mode: Option<String>,
}

impl DeploySpecBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the container image (required).
    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the container name. When omitted, a name is generated at
    /// deployment time.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in envs {
            self.env.push(format!("{}={}", k.into(), v.into()));
        }
        self
    }

    /// Forward a container port to a host port. `container_port` uses the
    /// engine's `port/protocol` form, e.g. `"25565/tcp"`.
    pub fn port<S: Into<String>>(mut self, container_port: S, host_port: u16) -> Self {
        self.ports.insert(container_port.into(), host_port);
        self
    }

    /// Set the restart policy (defaults to [`RestartPolicy::Always`]).
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Set the network mode (defaults to `bridge`).
    pub fn network_mode<S: Into<String>>(mut self, mode: S) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Build the deploy specification.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spec`] if the image is missing.
    pub fn build(self) -> Result<DeploySpec> {
        let image = self
            .image
            .ok_or_else(|| EngineError::Spec("image is required".to_string()))?;

        Ok(DeploySpec {
            image,
            name: self.name,
            env: self.env,
            ports: self.ports,
            restart_policy: self.restart_policy,
            network_mode: self.network_mode.unwrap_or_else(|| "bridge".to_string()),
        })
    }
}

/// A fully specified deployment, consumed by
/// [`EngineConnection::run`](crate::engine::EngineConnection::run).
#[derive(Debug, Clone)]
pub struct DeploySpec {
    /// Image to deploy.
    pub image: String,
    /// Container name, generated when absent.
    pub name: Option<String>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Port forwards: container `port/protocol` to host port.
    pub ports: HashMap<String, u16>,
    /// Restart behavior.
    pub restart_policy: RestartPolicy,
    /// Engine network mode.
    pub network_mode: String,
}

impl DeploySpec {
    /// Create a new specification builder.
    pub fn builder() -> DeploySpecBuilder {
        DeploySpecBuilder::new()
    }

    /// Shorthand for an image-plus-name spec with defaults everywhere else.
    pub fn new<I: Into<String>, N: Into<String>>(image: I, name: N) -> Self {
        Self {
            image: image.into(),
            name: Some(name.into()),
            env: Vec::new(),
            ports: HashMap::new(),
            restart_policy: RestartPolicy::Always,
            network_mode: "bridge".to_string(),
        }
    }
}
