//! Docker inventory access
//!
//! The generation pipeline only sees the [`InventoryClient`] trait and the
//! lightweight inventory types below, so tests can drive it with an
//! in-memory implementation. [`DockerInventory`] is the production
//! implementation over bollard. None of the calls retry internally; the
//! callers isolate and log transport failures per sub-step.

use async_trait::async_trait;
use base64::Engine;
use bollard::container::ListContainersOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Error, Result};

/// Label Docker swarm stamps on containers that are tasks of a service
pub const SERVICE_TASK_LABEL: &str = "com.docker.swarm.service.id";

/// One address an entity holds on one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddr {
    pub network_id: String,
    pub address: String,
}

/// A running container as the pipeline sees it
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    /// Display name, possibly with Docker's leading slash
    pub name: String,
    pub labels: HashMap<String, String>,
    pub networks: Vec<NetworkAddr>,
}

/// A swarm service with its resolved candidate addresses
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Service virtual IPs, one per attached network
    pub virtual_ips: Vec<NetworkAddr>,
    /// Addresses of the service's running task containers
    pub task_addresses: Vec<NetworkAddr>,
}

#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub ingress: bool,
}

/// Swarm config object metadata (listing form)
#[derive(Debug, Clone)]
pub struct ConfigInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Swarm config object with its decoded payload
#[derive(Debug, Clone)]
pub struct ConfigPayload {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterInfo {
    /// True when this node participates in an active swarm
    pub active: bool,
}

/// One inventory-change notification from the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEvent {
    /// Entity kind: `container`, `service`, or `config`
    pub entity: String,
    pub action: String,
}

/// Read access to the orchestrator's live inventory
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn list_configs(&self) -> Result<Vec<ConfigInfo>>;
    async fn inspect_config(&self, id: &str) -> Result<ConfigPayload>;
    async fn list_services(&self) -> Result<Vec<ServiceInfo>>;
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;
    async fn inspect_network(&self, id: &str) -> Result<NetworkInfo>;
    /// The container this process itself runs in
    async fn inspect_self_container(&self) -> Result<ContainerInfo>;
    /// Long-lived change feed, filtered to container/service/config events.
    /// Dropping the stream cancels the subscription.
    fn subscribe_events(&self) -> BoxStream<'static, Result<InventoryEvent>>;
    async fn cluster_info(&self) -> Result<ClusterInfo>;
}

/// Production inventory client over the Docker API
#[derive(Clone)]
pub struct DockerInventory {
    client: Docker,
}

impl DockerInventory {
    /// Connect to the Docker daemon and verify it responds
    ///
    /// Connection priority: explicit `docker_host`, then the `DOCKER_HOST`
    /// environment variable, then bollard's platform defaults. This is the
    /// only fatal startup path.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let host = docker_host
            .map(String::from)
            .or_else(|| std::env::var("DOCKER_HOST").ok());

        let client = match host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                let socket = host.trim_start_matches("unix://");
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("Cannot connect to socket '{}': {}", socket, e))?
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("Cannot connect to '{}': {}", host, e))?
            }
            Some(host) => anyhow::bail!(
                "Invalid docker host '{}': expected 'unix:///path' or 'tcp://host:port'",
                host
            ),
            None => Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(DockerInventory { client })
    }

    /// Our own container id, from the cgroup hierarchy or the hostname
    fn current_container_id() -> Option<String> {
        if let Ok(cgroup) = std::fs::read_to_string("/proc/self/cgroup") {
            for line in cgroup.lines() {
                for piece in line.split(['/', '-', '.', ':']) {
                    if piece.len() == 64 && piece.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Some(piece.to_string());
                    }
                }
            }
        }
        // Docker sets the hostname to the short container id by default
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl InventoryClient for DockerInventory {
    async fn list_configs(&self) -> Result<Vec<ConfigInfo>> {
        let configs = self.client.list_configs::<String>(None).await?;
        Ok(configs
            .into_iter()
            .map(|config| {
                let spec = config.spec.unwrap_or_default();
                ConfigInfo {
                    id: config.id.unwrap_or_default(),
                    name: spec.name.unwrap_or_default(),
                    labels: spec.labels.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn inspect_config(&self, id: &str) -> Result<ConfigPayload> {
        let config = self.client.inspect_config(id).await?;
        let spec = config.spec.unwrap_or_default();
        let encoded = spec.data.unwrap_or_default();
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .unwrap_or_else(|_| encoded.into_bytes());
        Ok(ConfigPayload {
            name: spec.name.unwrap_or_default(),
            labels: spec.labels.unwrap_or_default(),
            data,
        })
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let services = self.client.list_services::<String>(None).await?;
        // Task addresses come from locally visible task containers; swarm
        // stamps each with the owning service id label.
        let containers = self.list_containers().await.unwrap_or_default();

        Ok(services
            .into_iter()
            .map(|service| {
                let id = service.id.unwrap_or_default();
                let spec = service.spec.unwrap_or_default();
                let virtual_ips = service
                    .endpoint
                    .and_then(|endpoint| endpoint.virtual_ips)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|vip| {
                        Some(NetworkAddr {
                            network_id: vip.network_id?,
                            address: strip_cidr_suffix(&vip.addr?),
                        })
                    })
                    .collect();
                let task_addresses = containers
                    .iter()
                    .filter(|container| {
                        container.labels.get(SERVICE_TASK_LABEL) == Some(&id)
                    })
                    .flat_map(|container| container.networks.iter().cloned())
                    .collect();
                ServiceInfo {
                    id,
                    name: spec.name.unwrap_or_default(),
                    labels: spec.labels.unwrap_or_default(),
                    virtual_ips,
                    task_addresses,
                }
            })
            .collect())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|container| {
                let networks = container
                    .network_settings
                    .and_then(|settings| settings.networks)
                    .unwrap_or_default()
                    .into_values()
                    .filter_map(|endpoint| {
                        let address = endpoint.ip_address.filter(|ip| !ip.is_empty())?;
                        Some(NetworkAddr {
                            network_id: endpoint.network_id.unwrap_or_default(),
                            address,
                        })
                    })
                    .collect();
                ContainerInfo {
                    id: container.id.unwrap_or_default(),
                    name: container
                        .names
                        .unwrap_or_default()
                        .into_iter()
                        .next()
                        .unwrap_or_default(),
                    labels: container.labels.unwrap_or_default(),
                    networks,
                }
            })
            .collect())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let networks = self.client.list_networks::<String>(None).await?;
        Ok(networks
            .into_iter()
            .map(|network| NetworkInfo {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
                ingress: network.ingress.unwrap_or(false),
            })
            .collect())
    }

    async fn inspect_network(&self, id: &str) -> Result<NetworkInfo> {
        let network = self.client.inspect_network::<String>(id, None).await?;
        Ok(NetworkInfo {
            id: network.id.unwrap_or_default(),
            name: network.name.unwrap_or_default(),
            ingress: network.ingress.unwrap_or(false),
        })
    }

    async fn inspect_self_container(&self) -> Result<ContainerInfo> {
        let id = Self::current_container_id().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "not running inside a container",
            ))
        })?;
        let inspected = self.client.inspect_container(&id, None).await?;
        let networks = inspected
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default()
            .into_values()
            .filter_map(|endpoint| {
                let address = endpoint.ip_address.filter(|ip| !ip.is_empty())?;
                Some(NetworkAddr {
                    network_id: endpoint.network_id.unwrap_or_default(),
                    address,
                })
            })
            .collect();
        Ok(ContainerInfo {
            id: inspected.id.unwrap_or_default(),
            name: inspected.name.unwrap_or_default(),
            labels: inspected
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
            networks,
        })
    }

    fn subscribe_events(&self) -> BoxStream<'static, Result<InventoryEvent>> {
        let client = self.client.clone();
        let (tx, rx) = futures::channel::mpsc::unbounded();

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert(
                "type".to_string(),
                vec![
                    "container".to_string(),
                    "service".to_string(),
                    "config".to_string(),
                ],
            );
            let options = EventsOptions::<String> {
                since: None,
                until: None,
                filters,
            };
            let mut events = client.events(Some(options));
            while let Some(item) = events.next().await {
                let mapped = item
                    .map(|event| InventoryEvent {
                        entity: event
                            .typ
                            .map(|t| t.to_string())
                            .unwrap_or_default()
                            .to_ascii_lowercase(),
                        action: event.action.unwrap_or_default(),
                    })
                    .map_err(Error::from);
                // Receiver dropped means the subscription was canceled
                if tx.unbounded_send(mapped).is_err() {
                    break;
                }
            }
        });

        Box::pin(rx)
    }

    async fn cluster_info(&self) -> Result<ClusterInfo> {
        let info = self.client.info().await?;
        let active = info
            .swarm
            .and_then(|swarm| swarm.local_node_state)
            .map(|state| state == bollard::models::LocalNodeState::ACTIVE)
            .unwrap_or(false);
        Ok(ClusterInfo { active })
    }
}

/// Swarm reports VIPs in CIDR form (`10.0.0.3/24`)
fn strip_cidr_suffix(address: &str) -> String {
    match address.split_once('/') {
        Some((ip, _)) => ip.to_string(),
        None => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_cidr_suffix() {
        assert_eq!(strip_cidr_suffix("10.0.0.3/24"), "10.0.0.3");
        assert_eq!(strip_cidr_suffix("10.0.0.3"), "10.0.0.3");
    }
}
