use caddywarden::adapter::StructuredAdapter;
use caddywarden::config::Options;
use caddywarden::docker::DockerInventory;
use caddywarden::loader::DockerLoader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caddywarden=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load options (optional TOML path as first argument, env on top)
    let options_path = std::env::args().nth(1).map(PathBuf::from);
    let options = Options::load(options_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load options");
        e
    })?;
    let options = Arc::new(options);

    print_startup_banner(&options);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = options.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Docker connectivity is the only fatal startup condition
    let client = DockerInventory::connect(options.docker_host.as_deref()).await?;
    let client = Arc::new(client);

    let loader = DockerLoader::new(client, Arc::clone(&options), Arc::new(StructuredAdapter))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loader_handle = tokio::spawn(loader.run(shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the loop to finish its current pass
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), loader_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(options: &Options) {
    info!(name = PKG_NAME, version = VERSION, "Starting controller");
    info!(
        label_prefix = %options.label_prefix,
        caddyfile_path = ?options.caddyfile_path,
        polling_interval_secs = options.polling_interval_secs,
        process_caddyfile = options.process_caddyfile,
        proxy_service_tasks = options.proxy_service_tasks,
        "Generation settings"
    );
    info!(
        ingress_networks = ?options.ingress_networks,
        controlled_servers_label = %options.controlled_servers_label,
        controller_network = ?options.controller_network,
        controlled_server_port = options.controlled_server_port,
        mode = ?options.mode,
        "Distribution settings"
    );
    info!(
        template_dir = %options.template_dir.display(),
        artifact_path = %options.artifact_path.display(),
        "Paths"
    );
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}
