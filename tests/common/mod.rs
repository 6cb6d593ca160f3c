//! In-memory inventory used by the integration tests

use async_trait::async_trait;
use caddywarden::config::Options;
use caddywarden::docker::{
    ClusterInfo, ConfigInfo, ConfigPayload, ContainerInfo, InventoryClient, InventoryEvent,
    NetworkAddr, NetworkInfo, ServiceInfo,
};
use caddywarden::error::{Error, Result};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Inventory backed by plain vectors; containers are mutable so tests can
/// change the fleet between passes.
#[derive(Default)]
pub struct MockInventory {
    pub containers: Mutex<Vec<ContainerInfo>>,
    pub services: Vec<ServiceInfo>,
    pub configs: Vec<ConfigPayload>,
    pub networks: Vec<NetworkInfo>,
    pub cluster_active: bool,
}

impl MockInventory {
    pub fn push_container(&self, container: ContainerInfo) {
        self.containers.lock().push(container);
    }
}

#[async_trait]
impl InventoryClient for MockInventory {
    async fn list_configs(&self) -> Result<Vec<ConfigInfo>> {
        Ok(self
            .configs
            .iter()
            .enumerate()
            .map(|(index, payload)| ConfigInfo {
                id: index.to_string(),
                name: payload.name.clone(),
                labels: payload.labels.clone(),
            })
            .collect())
    }

    async fn inspect_config(&self, id: &str) -> Result<ConfigPayload> {
        let index: usize = id.parse().map_err(|_| not_found("config id"))?;
        self.configs.get(index).cloned().ok_or_else(|| not_found("config"))
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.services.clone())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.containers.lock().clone())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self.networks.clone())
    }

    async fn inspect_network(&self, id: &str) -> Result<NetworkInfo> {
        self.networks
            .iter()
            .find(|network| network.id == id)
            .cloned()
            .ok_or_else(|| not_found("network"))
    }

    async fn inspect_self_container(&self) -> Result<ContainerInfo> {
        Err(not_found("not running inside a container"))
    }

    fn subscribe_events(&self) -> BoxStream<'static, Result<InventoryEvent>> {
        Box::pin(futures::stream::pending())
    }

    async fn cluster_info(&self) -> Result<ClusterInfo> {
        Ok(ClusterInfo {
            active: self.cluster_active,
        })
    }
}

fn not_found(what: &str) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, what.to_string()))
}

pub fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn container(name: &str, label_pairs: &[(&str, &str)], addrs: &[(&str, &str)]) -> ContainerInfo {
    ContainerInfo {
        id: format!("id-{}", name.trim_start_matches('/')),
        name: name.to_string(),
        labels: labels(label_pairs),
        networks: addrs
            .iter()
            .map(|(network_id, address)| NetworkAddr {
                network_id: network_id.to_string(),
                address: address.to_string(),
            })
            .collect(),
    }
}

/// Options pointed at scratch paths so passes leave no global artifacts
pub fn test_options(scratch: &std::path::Path) -> Options {
    let mut options = Options::default();
    options.artifact_path = scratch.join("docker-plugin.caddyfile");
    options.template_dir = scratch.join("templates");
    options
}
