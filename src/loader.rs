//! Reconciliation loop and configuration distribution
//!
//! [`DockerLoader`] decides when to regenerate (startup, poll interval,
//! debounced event bursts) and pushes each new configuration version to
//! every controlled server. Only one pass runs at a time; per-server pushes
//! fan out concurrently and are joined before the pass completes.
//!
//! Per-server guarantees: an in-flight push blocks a second concurrent push
//! to the same address (`updating` guard), and a server never receives a
//! version at or below the one it last acknowledged. Failed pushes leave
//! the acknowledged version untouched, so the next trigger retries them.

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapter::ConfigAdapter;
use crate::config::Options;
use crate::docker::{InventoryClient, InventoryEvent};
use crate::error::{Error, Result};
use crate::generator::CaddyfileGenerator;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-server mutable state shared with the push workers
#[derive(Default)]
struct DistributionState {
    /// Highest version each server acknowledged
    versions: DashMap<String, i64>,
    /// Servers with a push currently in flight
    updating: DashMap<String, ()>,
}

impl DistributionState {
    /// Returns false when a push to this server is already in flight
    fn begin_update(&self, server: &str) -> bool {
        self.updating.insert(server.to_string(), ()).is_none()
    }

    fn finish_update(&self, server: &str) {
        self.updating.remove(server);
    }

    fn acked_version(&self, server: &str) -> i64 {
        self.versions.get(server).map(|v| *v).unwrap_or(0)
    }
}

/// Drives generation passes and keeps controlled servers current
pub struct DockerLoader<C> {
    options: Arc<Options>,
    client: Arc<C>,
    generator: CaddyfileGenerator<C>,
    adapter: Arc<dyn ConfigAdapter>,
    http: reqwest::Client,
    state: Arc<DistributionState>,
    skip_events: Arc<AtomicBool>,
    last_caddyfile: Vec<u8>,
    last_payload: Option<Value>,
    last_version: i64,
}

impl<C: InventoryClient + 'static> DockerLoader<C> {
    pub fn new(
        client: Arc<C>,
        options: Arc<Options>,
        adapter: Arc<dyn ConfigAdapter>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        let generator = CaddyfileGenerator::new(Arc::clone(&client), Arc::clone(&options));
        Ok(DockerLoader {
            options,
            client,
            generator,
            adapter,
            http,
            state: Arc::new(DistributionState::default()),
            skip_events: Arc::new(AtomicBool::new(false)),
            last_caddyfile: Vec::new(),
            last_payload: None,
            last_version: 0,
        })
    }

    pub fn generator(&self) -> &CaddyfileGenerator<C> {
        &self.generator
    }

    /// Version of the most recently adapted configuration
    pub fn current_version(&self) -> i64 {
        self.last_version
    }

    /// Highest version a server has acknowledged (0 if never pushed)
    pub fn acked_version(&self, server: &str) -> i64 {
        self.state.acked_version(server)
    }

    /// Mark a push to `server` as in flight; false if one already is
    pub fn begin_update(&self, server: &str) -> bool {
        self.state.begin_update(server)
    }

    pub fn finish_update(&self, server: &str) {
        self.state.finish_update(server)
    }

    /// Run until shutdown: one immediate pass, then poll and event triggers
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);

        tokio::spawn(monitor_events(
            Arc::clone(&self.client),
            Arc::clone(&self.skip_events),
            trigger_tx,
            self.options.event_backoff(),
            shutdown_rx.clone(),
        ));

        let mut deadline = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    deadline = Instant::now() + self.options.polling_interval();
                    self.skip_events.store(false, Ordering::SeqCst);
                    self.run_pass().await;
                }
                Some(()) = trigger_rx.recv() => {
                    // Coalesce an event burst into one near-term pass
                    deadline = Instant::now() + self.options.debounce();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Reconciliation loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One generation pass followed by distribution to every controlled server
    pub async fn run_pass(&mut self) {
        let generated = self.generator.generate().await;

        let changed = generated.caddyfile != self.last_caddyfile;
        self.last_caddyfile = generated.caddyfile;

        if changed {
            info!(
                caddyfile = %String::from_utf8_lossy(&self.last_caddyfile),
                "New Caddyfile"
            );
            let adapted = match self.adapter.adapt(&self.last_caddyfile) {
                Ok(adapted) => adapted,
                Err(err) => {
                    // Previous version stays authoritative for this pass
                    error!(error = %err, "failed to adapt caddyfile into config payload");
                    return;
                }
            };
            for warning in &adapted.warnings {
                warn!(warning = %warning, "caddyfile adapter warning");
            }
            debug!(payload = %adapted.payload, "New config payload");
            self.last_payload = Some(adapted.payload);
            self.last_version += 1;
        }

        self.distribute(generated.controlled_servers).await;
    }

    /// Push the current version to every server that is not yet on it
    async fn distribute(&self, servers: Vec<String>) {
        let payload = match &self.last_payload {
            Some(payload) => payload.clone(),
            // Nothing adapted yet; every server is trivially current
            None => return,
        };

        let mut pushes = JoinSet::new();
        for server in servers {
            pushes.spawn(update_server(
                Arc::clone(&self.state),
                self.http.clone(),
                server,
                payload.clone(),
                self.last_version,
                self.options.controlled_server_port,
            ));
        }
        while pushes.join_next().await.is_some() {}
    }
}

/// Push one version to one server, honoring the in-flight and version guards
async fn update_server(
    state: Arc<DistributionState>,
    http: reqwest::Client,
    server: String,
    payload: Value,
    version: i64,
    port: u16,
) {
    // Drop the attempt when a push is in flight; the next trigger retries
    if !state.begin_update(&server) {
        return;
    }

    if state.acked_version(&server) < version {
        info!(server = %server, version, "Sending configuration");
        match push_config(&http, &server, port, &payload).await {
            Ok(()) => {
                state.versions.insert(server.clone(), version);
                info!(server = %server, version, "Successfully configured");
            }
            Err(err) => {
                error!(server = %server, error = %err, "Failed to send configuration");
            }
        }
    }

    state.finish_update(&server);
}

async fn push_config(
    http: &reqwest::Client,
    server: &str,
    port: u16,
    payload: &Value,
) -> Result<()> {
    let body = add_admin_listen(payload, &format!("tcp/{}:{}", server, port))?;
    let url = format!("http://{}:{}/load", server, port);

    let response = http
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|err| Error::delivery(server, err.to_string()))?;

    if response.status() != reqwest::StatusCode::OK {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::delivery(
            server,
            format!("status {}: {}", status, body),
        ));
    }

    Ok(())
}

/// Bind the pushed config's admin endpoint to the target server's address
fn add_admin_listen(payload: &Value, listen: &str) -> Result<Value> {
    let mut payload = payload.clone();
    match payload.as_object_mut() {
        Some(object) => {
            object.insert("admin".to_string(), json!({ "listen": listen }));
            Ok(payload)
        }
        None => Err(Error::Adapt("wire payload is not a JSON object".to_string())),
    }
}

/// Actions that warrant regenerating the configuration
fn is_relevant(event: &InventoryEvent) -> bool {
    matches!(
        (event.entity.as_str(), event.action.as_str()),
        ("container", "create" | "start" | "stop" | "die" | "destroy")
            | ("service", "create" | "update" | "remove")
            | ("config", "create" | "remove")
    )
}

/// Supervised event-stream reader: reconnects forever with a fixed backoff
async fn monitor_events<C: InventoryClient>(
    client: Arc<C>,
    skip_events: Arc<AtomicBool>,
    trigger: mpsc::Sender<()>,
    backoff: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        info!("Connecting to docker events");
        let mut events = client.subscribe_events();

        loop {
            tokio::select! {
                item = events.next() => match item {
                    Some(Ok(event)) => {
                        if skip_events.load(Ordering::SeqCst) {
                            continue;
                        }
                        if is_relevant(&event) {
                            skip_events.store(true, Ordering::SeqCst);
                            let _ = trigger.try_send(());
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "Docker events error");
                        break;
                    }
                    None => {
                        warn!("Docker event stream ended");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }

        // Dropping the stream cancels the subscription before reconnecting
        drop(events);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(entity: &str, action: &str) -> InventoryEvent {
        InventoryEvent {
            entity: entity.to_string(),
            action: action.to_string(),
        }
    }

    #[test]
    fn test_relevant_event_classification() {
        assert!(is_relevant(&event("container", "create")));
        assert!(is_relevant(&event("container", "die")));
        assert!(is_relevant(&event("service", "update")));
        assert!(is_relevant(&event("config", "remove")));

        assert!(!is_relevant(&event("container", "exec_start")));
        assert!(!is_relevant(&event("service", "start")));
        assert!(!is_relevant(&event("network", "create")));
        assert!(!is_relevant(&event("config", "update")));
    }

    #[test]
    fn test_add_admin_listen() {
        let payload = json!({ "config": [] });
        let augmented = add_admin_listen(&payload, "tcp/10.0.0.5:2019").unwrap();
        assert_eq!(augmented["admin"]["listen"], "tcp/10.0.0.5:2019");
        assert_eq!(augmented["config"], json!([]));
        // The shared payload is untouched
        assert!(payload.get("admin").is_none());

        assert!(add_admin_listen(&json!([1, 2]), "tcp/x:2019").is_err());
    }

    #[test]
    fn test_updating_guard_is_exclusive_until_finished() {
        let state = DistributionState::default();
        assert!(state.begin_update("10.0.0.5"));
        assert!(!state.begin_update("10.0.0.5"));
        assert!(state.begin_update("10.0.0.6"));
        state.finish_update("10.0.0.5");
        assert!(state.begin_update("10.0.0.5"));
    }

    #[test]
    fn test_acked_version_defaults_to_zero() {
        let state = DistributionState::default();
        assert_eq!(state.acked_version("10.0.0.5"), 0);
        state.versions.insert("10.0.0.5".to_string(), 5);
        assert_eq!(state.acked_version("10.0.0.5"), 5);
    }
}
