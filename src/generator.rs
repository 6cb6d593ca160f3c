//! Caddyfile generation pipeline
//!
//! One [`CaddyfileGenerator::generate`] call is one reconciliation pass: it
//! assembles fragments from the base file, swarm configs, services, and
//! containers into a single document, collects the controlled-server
//! addresses encountered along the way, lifts global option blocks to the
//! front, and returns the serialized bytes together with the pass's
//! diagnostic transcript.
//!
//! Every fragment-producing step is isolated: a failure becomes a
//! diagnostic line and the pass continues with the remaining sources.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::caddyfile::{self, Document};
use crate::config::Options;
use crate::diagnostics::Diagnostics;
use crate::docker::{InventoryClient, NetworkAddr, ServiceInfo, SERVICE_TASK_LABEL};
use crate::error::Result;
use crate::labels::{labels_to_document, LabelFilter};
use crate::templates::{ContainerContext, ServiceContext, TemplateContext, TemplateEngine};

const SWARM_AVAILABILITY_CACHE: Duration = Duration::from_secs(60);
const EMPTY_PLACEHOLDER: &[u8] = b"# Empty caddyfile";

/// Output of one generation pass
#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub caddyfile: Vec<u8>,
    /// Per-pass diagnostic transcript
    pub logs: String,
    /// Addresses of servers this process must push configuration to
    pub controlled_servers: Vec<String>,
}

/// Assembles one Caddyfile per pass from the live inventory
pub struct CaddyfileGenerator<C> {
    options: Arc<Options>,
    client: Arc<C>,
    label_filter: LabelFilter,
    templates: TemplateEngine,
    /// Network ids reachable from our namespace; `None` until computed
    ingress_networks: Option<HashSet<String>>,
    swarm_available: bool,
    swarm_checked_at: Option<Instant>,
}

impl<C: InventoryClient> CaddyfileGenerator<C> {
    pub fn new(client: Arc<C>, options: Arc<Options>) -> Self {
        let label_filter = LabelFilter::new(options.label_prefix.clone());
        let templates = TemplateEngine::new(options.template_dir.clone());
        CaddyfileGenerator {
            options,
            client,
            label_filter,
            templates,
            ingress_networks: None,
            swarm_available: false,
            swarm_checked_at: None,
        }
    }

    pub fn template_engine(&self) -> &TemplateEngine {
        &self.templates
    }

    /// Run one full generation pass
    pub async fn generate(&mut self) -> GeneratedConfig {
        let mut diags = Diagnostics::new();

        self.ensure_ingress_networks(&mut diags).await;
        self.refresh_swarm_availability().await;
        if let Err(err) = self.templates.ensure_watcher() {
            info!(error = %err, "no template dir to watch");
        }

        let mut aggregate = Document::new();
        let mut controlled_servers: Vec<String> = Vec::new();

        self.merge_base_file(&mut aggregate, &mut diags);
        self.merge_swarm_configs(&mut aggregate, &mut diags).await;
        self.merge_services(&mut aggregate, &mut controlled_servers, &mut diags)
            .await;
        self.merge_containers(&mut aggregate, &mut controlled_servers, &mut diags)
            .await;

        // Global option blocks must precede scoped blocks in the output
        let mut global = Document::new();
        let global_blocks: Vec<_> = aggregate
            .blocks
            .iter()
            .filter(|block| block.is_global_block())
            .cloned()
            .collect();
        for block in global_blocks {
            aggregate.remove(&block);
            global.add_block(block);
        }

        let mut content = global.serialize();
        content.extend(aggregate.serialize());

        if self.options.process_caddyfile {
            let (processed, process_logs) = caddyfile::process(content);
            content = processed;
            diags.append_raw(&process_logs);
        }

        if content.is_empty() {
            content = EMPTY_PLACEHOLDER.to_vec();
        }

        if self.options.is_server_mode() {
            controlled_servers.push("localhost".to_string());
        }

        // Informational copy of the result; never fails the pass
        if let Err(err) = std::fs::write(&self.options.artifact_path, &content) {
            warn!(
                path = %self.options.artifact_path.display(),
                error = %err,
                "failed to write caddyfile artifact"
            );
        }

        GeneratedConfig {
            caddyfile: content,
            logs: diags.into_text(),
            controlled_servers,
        }
    }

    async fn ensure_ingress_networks(&mut self, diags: &mut Diagnostics) {
        if self.ingress_networks.is_some() {
            return;
        }
        match self.compute_ingress_networks().await {
            Ok(networks) => {
                info!(networks = ?networks, "ingress networks resolved");
                self.ingress_networks = Some(networks);
            }
            // Left unset: this pass applies no filtering, the next retries
            Err(err) => diags.error(err.to_string()),
        }
    }

    async fn compute_ingress_networks(&self) -> Result<HashSet<String>> {
        let mut networks = HashSet::new();
        if !self.options.ingress_networks.is_empty() {
            for network in self.client.list_networks().await? {
                if network.ingress {
                    continue;
                }
                if self.options.ingress_networks.contains(&network.name) {
                    networks.insert(network.id);
                }
            }
        } else {
            let own = self.client.inspect_self_container().await?;
            info!(container = %own.id, "resolved own container");
            for attachment in &own.networks {
                let network = self.client.inspect_network(&attachment.network_id).await?;
                if !network.ingress {
                    networks.insert(network.id);
                }
            }
        }
        Ok(networks)
    }

    async fn refresh_swarm_availability(&mut self) {
        let stale = self
            .swarm_checked_at
            .map(|checked| checked.elapsed() > SWARM_AVAILABILITY_CACHE)
            .unwrap_or(true);
        if !stale {
            return;
        }
        let first_check = self.swarm_checked_at.is_none();
        self.swarm_checked_at = Some(Instant::now());

        match self.client.cluster_info().await {
            Ok(cluster) => {
                if first_check || cluster.active != self.swarm_available {
                    info!(available = cluster.active, "swarm availability");
                }
                self.swarm_available = cluster.active;
            }
            Err(err) => {
                error!(error = %err, "swarm availability check failed");
                self.swarm_available = false;
            }
        }
    }

    fn merge_base_file(&self, aggregate: &mut Document, diags: &mut Diagnostics) {
        let path = match &self.options.caddyfile_path {
            Some(path) => path,
            None => {
                diags.info("Skipping default Caddyfile because no path is set");
                return;
            }
        };
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) => {
                diags.error(format!("{}: {}", path.display(), err));
                return;
            }
        };
        match Document::parse(&raw) {
            Ok(fragment) => aggregate.merge(fragment),
            Err(err) => diags.error(err.to_string()),
        }
    }

    /// Merge labeled swarm configs and register template-tagged ones
    async fn merge_swarm_configs(&self, aggregate: &mut Document, diags: &mut Diagnostics) {
        if !self.swarm_available {
            diags.info("Skipping configs because swarm is not available");
            return;
        }
        let configs = match self.client.list_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                diags.error(err.to_string());
                return;
            }
        };
        let template_label = format!("{}.template", self.options.label_prefix);
        for config in configs {
            let is_fragment = config.labels.contains_key(&self.options.label_prefix);
            let is_template = config.labels.contains_key(&template_label);
            if !is_fragment && !is_template {
                continue;
            }
            let payload = match self.client.inspect_config(&config.id).await {
                Ok(payload) => payload,
                Err(err) => {
                    diags.error(err.to_string());
                    continue;
                }
            };
            if is_fragment {
                match Document::parse(&payload.data) {
                    Ok(fragment) => aggregate.merge(fragment),
                    Err(err) => diags.error(err.to_string()),
                }
            }
            if is_template {
                self.templates.queue_template(
                    payload.name.clone(),
                    String::from_utf8_lossy(&payload.data).into_owned(),
                );
            }
        }
    }

    async fn merge_services(
        &self,
        aggregate: &mut Document,
        controlled_servers: &mut Vec<String>,
        diags: &mut Diagnostics,
    ) {
        if !self.swarm_available {
            diags.info("Skipping services because swarm is not available");
            return;
        }
        let services = match self.client.list_services().await {
            Ok(services) => services,
            Err(err) => {
                diags.error(err.to_string());
                return;
            }
        };
        for service in services {
            diags.debug(format!("Swarm service {}", service.name));

            if service
                .labels
                .contains_key(&self.options.controlled_servers_label)
            {
                // Controlled-server discovery never applies ingress filtering
                let addrs: Vec<String> = service
                    .task_addresses
                    .iter()
                    .map(|addr| addr.address.clone())
                    .collect();
                self.collect_controlled(&addrs, controlled_servers);
            }

            let mut filtered = self.label_filter.filter(&service.labels);
            // The marker label is not a routing directive
            filtered.remove(&self.options.controlled_servers_label);
            aggregate.merge(labels_to_document(&filtered));

            let context = Arc::new(ServiceContext {
                name: service.name.clone(),
                labels: service.labels.clone(),
                upstream_addrs: self.service_upstreams(&service),
            }) as Arc<dyn TemplateContext>;
            aggregate.merge(self.templates.render_all(context, diags));
        }
    }

    async fn merge_containers(
        &self,
        aggregate: &mut Document,
        controlled_servers: &mut Vec<String>,
        diags: &mut Diagnostics,
    ) {
        let containers = match self.client.list_containers().await {
            Ok(containers) => containers,
            Err(err) => {
                diags.error(err.to_string());
                return;
            }
        };
        for container in containers {
            if let Some(service_id) = container.labels.get(SERVICE_TASK_LABEL) {
                diags.debug(format!(
                    "skipping container {}, task of service {}",
                    container.name, service_id
                ));
                continue;
            }
            diags.debug(format!("Container {}", container.name));

            if container
                .labels
                .contains_key(&self.options.controlled_servers_label)
            {
                let addrs: Vec<String> = container
                    .networks
                    .iter()
                    .map(|addr| addr.address.clone())
                    .collect();
                self.collect_controlled(&addrs, controlled_servers);
            }

            let mut filtered = self.label_filter.filter(&container.labels);
            filtered.remove(&self.options.controlled_servers_label);
            aggregate.merge(labels_to_document(&filtered));

            let context = Arc::new(ContainerContext {
                name: container.name.clone(),
                labels: container.labels.clone(),
                upstream_addrs: self.filter_by_ingress(&container.networks),
            }) as Arc<dyn TemplateContext>;
            aggregate.merge(self.templates.render_all(context, diags));
        }
    }

    fn service_upstreams(&self, service: &ServiceInfo) -> Vec<String> {
        if self.options.proxy_service_tasks {
            self.filter_by_ingress(&service.task_addresses)
        } else {
            self.filter_by_ingress(&service.virtual_ips)
        }
    }

    fn filter_by_ingress(&self, addrs: &[NetworkAddr]) -> Vec<String> {
        filter_by_ingress(self.ingress_networks.as_ref(), addrs)
    }

    fn collect_controlled(&self, addrs: &[String], controlled_servers: &mut Vec<String>) {
        for addr in addrs {
            if controller_allows(self.options.controller_network.as_ref(), addr) {
                controlled_servers.push(addr.clone());
            }
        }
    }
}

/// Keep addresses on ingress networks; no filtering until the set is known
fn filter_by_ingress(ingress: Option<&HashSet<String>>, addrs: &[NetworkAddr]) -> Vec<String> {
    match ingress {
        Some(networks) if !networks.is_empty() => addrs
            .iter()
            .filter(|addr| networks.contains(&addr.network_id))
            .map(|addr| addr.address.clone())
            .collect(),
        _ => addrs.iter().map(|addr| addr.address.clone()).collect(),
    }
}

/// Controller-network CIDR filter; unparseable addresses are dropped
fn controller_allows(network: Option<&ipnet::IpNet>, addr: &str) -> bool {
    match network {
        Some(network) => addr
            .parse::<std::net::IpAddr>()
            .map(|ip| network.contains(&ip))
            .unwrap_or(false),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(network_id: &str, address: &str) -> NetworkAddr {
        NetworkAddr {
            network_id: network_id.to_string(),
            address: address.to_string(),
        }
    }

    #[test]
    fn test_ingress_filter_applies_only_when_known() {
        let addrs = vec![addr("net-a", "10.0.0.2"), addr("net-b", "10.0.1.2")];

        assert_eq!(
            filter_by_ingress(None, &addrs),
            vec!["10.0.0.2", "10.0.1.2"]
        );
        assert_eq!(
            filter_by_ingress(Some(&HashSet::new()), &addrs),
            vec!["10.0.0.2", "10.0.1.2"]
        );

        let known: HashSet<String> = ["net-a".to_string()].into();
        assert_eq!(filter_by_ingress(Some(&known), &addrs), vec!["10.0.0.2"]);
    }

    #[test]
    fn test_controller_network_filter() {
        let network: ipnet::IpNet = "10.0.0.0/24".parse().unwrap();
        assert!(controller_allows(Some(&network), "10.0.0.5"));
        assert!(!controller_allows(Some(&network), "10.1.0.5"));
        assert!(!controller_allows(Some(&network), "not-an-ip"));
        assert!(controller_allows(None, "anything"));
    }
}
