//! Runtime options for the controller
//!
//! Options load from an optional TOML file (first CLI argument), with
//! environment variables (`CADDY_DOCKER_*`) layered on top. Invalid
//! environment values are warned about and ignored rather than fatal.

use ipnet::IpNet;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Whether this process only controls other servers or is itself one
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Generate and push configuration to labeled servers only
    #[default]
    Standalone,
    /// Additionally treat the local server as a controlled target
    Server,
}

/// Controller configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Options {
    /// Label prefix that opts entities into configuration generation
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Base Caddyfile merged ahead of all generated fragments (optional)
    pub caddyfile_path: Option<PathBuf>,

    /// Docker endpoint override (`unix:///...` or `tcp://...`)
    pub docker_host: Option<String>,

    /// Full reconciliation interval in seconds
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Debounce window applied to bursts of inventory events
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Reconnect delay after the event stream drops
    #[serde(default = "default_event_backoff")]
    pub event_backoff_secs: u64,

    /// Normalize the serialized Caddyfile before distribution
    #[serde(default = "default_true")]
    pub process_caddyfile: bool,

    /// Proxy swarm service tasks directly instead of the service VIP
    #[serde(default = "default_true")]
    pub proxy_service_tasks: bool,

    /// Ingress network names; empty means introspect our own container
    #[serde(default)]
    pub ingress_networks: Vec<String>,

    /// Label marking an entity as a controlled Caddy server
    #[serde(default = "default_controlled_servers_label")]
    pub controlled_servers_label: String,

    /// Restrict controlled-server addresses to this CIDR
    pub controller_network: Option<IpNet>,

    /// Admin API port on controlled servers
    #[serde(default = "default_controlled_server_port")]
    pub controlled_server_port: u16,

    /// Run mode (standalone controller vs. also a controlled server)
    #[serde(default)]
    pub mode: RunMode,

    /// Directory watched for `.tmpl` template files
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Best-effort copy of the latest serialized Caddyfile
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

fn default_label_prefix() -> String {
    "caddy".to_string()
}

fn default_polling_interval() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_event_backoff() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_controlled_servers_label() -> String {
    "caddy.controlled-server".to_string()
}

fn default_controlled_server_port() -> u16 {
    2019
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("/config/caddy/docker-proxy")
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("/config/caddy/docker-plugin.caddyfile")
}

impl Default for Options {
    fn default() -> Self {
        Options {
            label_prefix: default_label_prefix(),
            caddyfile_path: None,
            docker_host: None,
            polling_interval_secs: default_polling_interval(),
            debounce_ms: default_debounce_ms(),
            event_backoff_secs: default_event_backoff(),
            process_caddyfile: true,
            proxy_service_tasks: true,
            ingress_networks: Vec::new(),
            controlled_servers_label: default_controlled_servers_label(),
            controller_network: None,
            controlled_server_port: default_controlled_server_port(),
            mode: RunMode::default(),
            template_dir: default_template_dir(),
            artifact_path: default_artifact_path(),
            pid_file: None,
        }
    }
}

impl Options {
    /// Load options from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Options> {
        let mut options = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read options file '{}': {}", path.display(), e)
                })?;
                toml::from_str(&raw).map_err(|e| {
                    anyhow::anyhow!("Failed to parse options file '{}': {}", path.display(), e)
                })?
            }
            None => Options::default(),
        };
        options.apply_env_overrides();
        Ok(options)
    }

    /// Layer `CADDY_DOCKER_*` environment variables over the loaded values
    pub fn apply_env_overrides(&mut self) {
        if let Some(raw) = env_trimmed("CADDY_DOCKER_LABEL_PREFIX") {
            self.label_prefix = raw;
        }
        if let Some(raw) = env_trimmed("CADDY_DOCKER_CADDYFILE_PATH") {
            self.caddyfile_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env_trimmed("DOCKER_HOST") {
            self.docker_host.get_or_insert(raw);
        }
        if let Some(raw) = env_trimmed("CADDY_DOCKER_POLLING_INTERVAL") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => self.polling_interval_secs = secs,
                _ => warn!(value = %raw, "invalid CADDY_DOCKER_POLLING_INTERVAL, ignoring"),
            }
        }
        if let Some(raw) = env_trimmed("CADDY_DOCKER_PROCESS_CADDYFILE") {
            match raw.parse::<bool>() {
                Ok(flag) => self.process_caddyfile = flag,
                Err(_) => warn!(value = %raw, "invalid CADDY_DOCKER_PROCESS_CADDYFILE, ignoring"),
            }
        }
        if let Some(raw) = env_trimmed("CADDY_DOCKER_PROXY_SERVICE_TASKS") {
            match raw.parse::<bool>() {
                Ok(flag) => self.proxy_service_tasks = flag,
                Err(_) => warn!(value = %raw, "invalid CADDY_DOCKER_PROXY_SERVICE_TASKS, ignoring"),
            }
        }
        if let Some(raw) = env_trimmed("CADDY_DOCKER_INGRESS_NETWORKS") {
            self.ingress_networks = raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = env_trimmed("CADDY_CONTROLLED_SERVERS_LABEL") {
            self.controlled_servers_label = raw;
        }
        if let Some(raw) = env_trimmed("CADDY_CONTROLLER_NETWORK") {
            match raw.parse::<IpNet>() {
                Ok(network) => self.controller_network = Some(network),
                Err(err) => {
                    warn!(value = %raw, error = %err, "invalid CADDY_CONTROLLER_NETWORK, ignoring")
                }
            }
        }
        if let Some(raw) = env_trimmed("CADDY_DOCKER_MODE") {
            match raw.to_ascii_lowercase().as_str() {
                "standalone" => self.mode = RunMode::Standalone,
                "server" => self.mode = RunMode::Server,
                _ => warn!(value = %raw, "invalid CADDY_DOCKER_MODE, ignoring"),
            }
        }
        if let Some(raw) = env_trimmed("CADDY_DOCKER_TEMPLATE_DIR") {
            self.template_dir = PathBuf::from(raw);
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn event_backoff(&self) -> Duration {
        Duration::from_secs(self.event_backoff_secs)
    }

    pub fn is_server_mode(&self) -> bool {
        self.mode == RunMode::Server
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.label_prefix, "caddy");
        assert_eq!(options.polling_interval(), Duration::from_secs(30));
        assert_eq!(options.debounce(), Duration::from_millis(100));
        assert_eq!(options.controlled_server_port, 2019);
        assert!(options.process_caddyfile);
        assert!(!options.is_server_mode());
    }

    #[test]
    fn test_toml_parsing() {
        let options: Options = toml::from_str(
            r#"
label_prefix = "proxy"
polling_interval_secs = 5
mode = "server"
ingress_networks = ["frontend"]
controller_network = "10.0.0.0/24"
"#,
        )
        .unwrap();
        assert_eq!(options.label_prefix, "proxy");
        assert_eq!(options.polling_interval_secs, 5);
        assert!(options.is_server_mode());
        assert_eq!(options.ingress_networks, vec!["frontend"]);
        let network = options.controller_network.unwrap();
        assert!(network.contains(&"10.0.0.5".parse::<std::net::IpAddr>().unwrap()));
        assert!(!network.contains(&"10.1.0.5".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(toml::from_str::<Options>("polling_interval_secs = \"soon\"").is_err());
    }
}
