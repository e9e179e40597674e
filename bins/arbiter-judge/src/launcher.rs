/// Container Launcher - Ephemeral Agent Containers
///
/// **Core Responsibility:**
/// Start a container from a named image, find the host address its agent
/// port was published on, and make sure the container can always be removed.
///
/// **Ownership Rules:**
/// - Every created container is tracked in the submission's `ContainerSet`
///   before anything else talks to it
/// - `ContainerSet::release` removes one container exactly once
/// - `ContainerSet::release_all` is idempotent; whatever is still tracked
///   when the set is dropped is removed in the background

use crate::error::{PipelineError, Stage};
use crate::metrics;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortMap};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("{0}")]
    Other(String),
}

/// What to start: image, environment (`KEY=value`) and bookkeeping labels
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Seam between the pipeline and the container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container and return its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Published port bindings, as reported by the engine
    async fn inspect_ports(&self, container_id: &str) -> Result<Option<PortMap>, RuntimeError>;

    /// Force-remove a container together with its volumes
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
}

/// Docker-backed runtime
///
/// Containers publish all exposed ports and run without a TTY; memory and
/// CPU limits and a network are applied when configured. Without a network
/// Docker attaches its default bridge.
pub struct DockerRuntime {
    docker: Docker,
    limits: HostLimits,
}

/// Host-level settings shared by every container the runtime creates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostLimits {
    pub memory_limit_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub network: Option<String>,
}

impl HostLimits {
    pub fn new(memory_limit_mb: Option<u64>, cpu_limit: Option<f64>, network: Option<String>) -> Self {
        Self {
            memory_limit_bytes: memory_limit_mb.map(|mb| (mb as i64) * 1024 * 1024),
            nano_cpus: cpu_limit.map(|cpus| (cpus * 1_000_000_000.0) as i64),
            network,
        }
    }

    fn host_config(&self) -> HostConfig {
        HostConfig {
            publish_all_ports: Some(true),
            memory: self.memory_limit_bytes,
            nano_cpus: self.nano_cpus,
            network_mode: self.network.clone(),
            ..Default::default()
        }
    }
}

impl DockerRuntime {
    pub fn connect(
        memory_limit_mb: Option<u64>,
        cpu_limit: Option<f64>,
        network: Option<String>,
    ) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            limits: HostLimits::new(memory_limit_mb, cpu_limit, network),
        })
    }

    /// Pull the image unless it is already present locally
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let container_name = format!("arbiter-{}", uuid::Uuid::new_v4());
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(false),
            host_config: Some(self.limits.host_config()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let created = self.docker.create_container(Some(options), config).await?;
        for warning in &created.warnings {
            warn!(container_id = %created.id, warning = %warning, "Container created with warning");
        }
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn inspect_ports(&self, container_id: &str) -> Result<Option<PortMap>, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        Ok(inspect.network_settings.and_then(|settings| settings.ports))
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(container_id, Some(options)).await?;
        Ok(())
    }
}

/// Containers owned by one submission's pipeline
pub struct ContainerSet {
    runtime: Arc<dyn ContainerRuntime>,
    ids: Vec<String>,
}

impl ContainerSet {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            ids: Vec::new(),
        }
    }

    pub fn track(&mut self, container_id: String) {
        metrics::CONTAINERS_OWNED.inc();
        self.ids.push(container_id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Remove one tracked container; unknown or already released ids are ignored
    pub async fn release(&mut self, container_id: &str) {
        let Some(position) = self.ids.iter().position(|id| id == container_id) else {
            return;
        };
        let id = self.ids.remove(position);
        remove_logged(self.runtime.as_ref(), &id).await;
    }

    pub async fn release_all(&mut self) {
        for id in std::mem::take(&mut self.ids) {
            remove_logged(self.runtime.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerSet {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }

        // Cannot await in Drop - hand the leftovers to the runtime
        let ids = std::mem::take(&mut self.ids);
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for id in ids {
                        remove_logged(runtime.as_ref(), &id).await;
                    }
                });
            }
            Err(_) => {
                metrics::CONTAINERS_OWNED.sub(ids.len() as i64);
                warn!(containers = ?ids, "No async runtime left to remove containers");
            }
        }
    }
}

async fn remove_logged(runtime: &dyn ContainerRuntime, container_id: &str) {
    metrics::CONTAINERS_OWNED.dec();
    match runtime.remove(container_id).await {
        Ok(()) => debug!(container_id = %container_id, "Container removed"),
        Err(e) => warn!(container_id = %container_id, error = %e, "Failed to remove container"),
    }
}

/// Host-reachable address of an in-container agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub host: String,
    pub port: u16,
}

impl AgentEndpoint {
    pub fn process_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}/process", self.host, self.port)
        } else {
            format!("http://{}:{}/process", self.host, self.port)
        }
    }
}

/// Find the binding of `agent_port/tcp` in an inspection result
///
/// `host_override` wins over the reported host ip. Unspecified addresses are
/// reached through loopback.
pub fn resolve_endpoint(
    ports: Option<&PortMap>,
    agent_port: u16,
    host_override: Option<&str>,
) -> Result<AgentEndpoint, String> {
    let key = format!("{}/tcp", agent_port);
    let ports = ports.ok_or_else(|| "the container reports no port information".to_string())?;
    let binding = ports
        .get(&key)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.first())
        .ok_or_else(|| format!("no host binding for '{}'", key))?;

    let port = binding
        .host_port
        .as_deref()
        .ok_or_else(|| format!("binding for '{}' has no host port", key))?
        .parse::<u16>()
        .map_err(|e| format!("binding for '{}' has an invalid host port: {}", key, e))?;

    let host = match host_override {
        Some(host) => host.to_string(),
        None => match binding.host_ip.as_deref() {
            None | Some("") | Some("0.0.0.0") | Some("::") => "127.0.0.1".to_string(),
            Some(ip) => ip.to_string(),
        },
    };

    Ok(AgentEndpoint { host, port })
}

/// A started container whose agent can be contacted
#[derive(Debug, Clone)]
pub struct LaunchedContainer {
    pub id: String,
    pub endpoint: AgentEndpoint,
}

pub struct Launcher {
    runtime: Arc<dyn ContainerRuntime>,
    startup_grace: Duration,
    agent_host: Option<String>,
}

impl Launcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, startup_grace: Duration, agent_host: Option<String>) -> Self {
        Self {
            runtime,
            startup_grace,
            agent_host,
        }
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    /// Create, track, start and inspect a container, then wait out the
    /// startup grace so the agent can begin listening
    #[tracing::instrument(skip(self, spec, containers), fields(image = %spec.image))]
    pub async fn launch(
        &self,
        stage: Stage,
        spec: &ContainerSpec,
        agent_port: u16,
        containers: &mut ContainerSet,
    ) -> Result<LaunchedContainer, PipelineError> {
        let container_error = |source: RuntimeError| PipelineError::Container {
            stage,
            image: spec.image.clone(),
            source,
        };

        let id = self.runtime.create(spec).await.map_err(container_error)?;
        containers.track(id.clone());
        debug!(container_id = %id, "Container created");

        self.runtime.start(&id).await.map_err(container_error)?;
        let ports = self.runtime.inspect_ports(&id).await.map_err(container_error)?;

        let endpoint = resolve_endpoint(ports.as_ref(), agent_port, self.agent_host.as_deref())
            .map_err(|detail| PipelineError::PortBinding {
                stage,
                image: spec.image.clone(),
                port: agent_port,
                detail,
            })?;

        info!(
            container_id = %id,
            host = %endpoint.host,
            port = endpoint.port,
            "Container started"
        );

        tokio::time::sleep(self.startup_grace).await;
        Ok(LaunchedContainer { id, endpoint })
    }
}
