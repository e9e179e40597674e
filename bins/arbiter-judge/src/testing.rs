// In-process stand-ins for the container engine, shared by unit and pipeline tests

use crate::launcher::{ContainerRuntime, ContainerSpec, RuntimeError};
use async_trait::async_trait;
use bollard::models::{PortBinding, PortMap};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    next_id: usize,
    images: HashMap<String, String>,
    created: Vec<String>,
    specs: Vec<ContainerSpec>,
    removed: Vec<String>,
}

/// Container runtime that "starts" containers whose agents are mock HTTP servers
///
/// Every container publishes both agent ports, bound to the address
/// registered for its image.
pub struct FakeRuntime {
    agents: HashMap<String, SocketAddr>,
    publish_ports: bool,
    fail_create: bool,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            publish_ports: true,
            fail_create: false,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_agent(mut self, image: &str, address: SocketAddr) -> Self {
        self.agents.insert(image.to_string(), address);
        self
    }

    pub fn without_ports(mut self) -> Self {
        self.publish_ports = false;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn created_images(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .specs
            .iter()
            .map(|spec| spec.image.clone())
            .collect()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if self.fail_create {
            return Err(RuntimeError::Other(format!("no such image: {}", spec.image)));
        }

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.images.insert(id.clone(), spec.image.clone());
        state.created.push(id.clone());
        state.specs.push(spec.clone());
        Ok(id)
    }

    async fn start(&self, _container_id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn inspect_ports(&self, container_id: &str) -> Result<Option<PortMap>, RuntimeError> {
        if !self.publish_ports {
            return Ok(None);
        }

        let image = self
            .state
            .lock()
            .unwrap()
            .images
            .get(container_id)
            .cloned()
            .ok_or_else(|| RuntimeError::Other(format!("no such container: {}", container_id)))?;

        let mut ports = PortMap::new();
        if let Some(address) = self.agents.get(&image) {
            for agent_port in [7742u16, 7743u16] {
                ports.insert(
                    format!("{}/tcp", agent_port),
                    Some(vec![PortBinding {
                        host_ip: Some(address.ip().to_string()),
                        host_port: Some(address.port().to_string()),
                    }]),
                );
            }
        }
        Ok(Some(ports))
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .removed
            .push(container_id.to_string());
        Ok(())
    }
}
