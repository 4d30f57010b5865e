//! Editor Registry daemon - serves the instance table over local JSON-RPC.
//!
//! Launchers and the control client start this binary on demand. It listens
//! on `127.0.0.1`, probes registered editors in the background and exits
//! after a `shutdown` request or Ctrl-C once in-flight requests are answered.

mod server;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use editor_registry::ipc::RegistryClient;
use editor_registry::remote::{NvimRemote, Probe, TcpProbe};
use editor_registry::{daemon, RegistryConfig, RegistrySettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ProbeKind {
    /// TCP connect to the registered address
    Tcp,
    /// `nvim --server <addr> --remote-expr 1`
    Nvim,
}

#[derive(Parser, Debug)]
#[command(name = "editor-registryd")]
#[command(about = "Instance registry daemon for editor front-ends")]
struct Args {
    /// Port on 127.0.0.1 to listen on (0 = auto-assign)
    #[arg(short, long, env = "EDITOR_REGISTRY_PORT", default_value_t = RegistryConfig::DEFAULT_PORT)]
    port: u16,

    /// How long a granted reservation stays valid, in milliseconds
    #[arg(long, env = "EDITOR_REGISTRY_RESERVATION_TTL_MS", default_value_t = millis(RegistryConfig::RESERVATION_TTL))]
    reservation_ttl_ms: u64,

    /// How long a never-reachable instance is tolerated, in milliseconds
    #[arg(long, env = "EDITOR_REGISTRY_STARTUP_GRACE_MS", default_value_t = millis(RegistryConfig::STARTUP_GRACE))]
    startup_grace_ms: u64,

    /// Upper bound for one liveness probe, in milliseconds
    #[arg(long, env = "EDITOR_REGISTRY_PROBE_TIMEOUT_MS", default_value_t = millis(RegistryConfig::PROBE_TIMEOUT))]
    probe_timeout_ms: u64,

    /// Period of the background liveness sweep, in milliseconds
    #[arg(long, env = "EDITOR_REGISTRY_SWEEP_INTERVAL_MS", default_value_t = millis(RegistryConfig::SWEEP_INTERVAL))]
    sweep_interval_ms: u64,

    /// How registered instances are probed
    #[arg(long, value_enum, default_value_t = ProbeKind::Nvim)]
    probe: ProbeKind,

    /// Neovim client binary used by the nvim probe
    #[arg(long, default_value = "nvim")]
    nvim: PathBuf,

    /// Do not probe an instance before returning it from a query
    #[arg(long)]
    no_probe_on_query: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Re-launch in the background and return once it is serving
    #[arg(long)]
    detach: bool,
}

const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl Args {
    fn settings(&self) -> RegistrySettings {
        RegistrySettings {
            port: self.port,
            reservation_ttl: Duration::from_millis(self.reservation_ttl_ms),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            probe_on_query: !self.no_probe_on_query,
        }
    }

    fn probe(&self) -> Arc<dyn Probe> {
        match self.probe {
            ProbeKind::Tcp => Arc::new(TcpProbe),
            ProbeKind::Nvim => Arc::new(NvimRemote::new(&self.nvim)),
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

/// Re-execute this binary without `--detach` and wait until it serves.
async fn detach(settings: &RegistrySettings) -> Result<()> {
    if settings.port == 0 {
        bail!("--detach needs a fixed port");
    }

    let client = RegistryClient::new(settings.endpoint());
    if client.is_reachable().await {
        bail!("A registry is already listening on {}", settings.endpoint());
    }

    let exe = std::env::current_exe()?;
    let args = std::env::args_os()
        .skip(1)
        .filter(|arg| arg.as_os_str() != "--detach");
    let pid = daemon::spawn_detached(&exe, args)?;

    daemon::wait_until_reachable(&client, RegistryConfig::DAEMON_START_TIMEOUT).await?;
    info!("Registry running in background (PID {}) on {}", pid, settings.endpoint());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let settings = args.settings();
    if args.detach {
        return detach(&settings).await;
    }

    info!("Starting editor registry");

    let daemon = server::start_daemon(&settings, args.probe()).await?;

    // Print the bound address for whoever launched us (intentional stdout)
    println!("REGISTRY_ADDR={}", daemon.addr());

    info!(
        "Registry listening on {} (reservation ttl {:?}, startup grace {:?})",
        daemon.addr(),
        settings.reservation_ttl,
        settings.startup_grace
    );

    let signal = daemon.shutdown_signal();
    let mut stopped = signal.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("Shutdown signal received");
                    signal.trigger();
                }
            }
            _ = stopped.wait() => {}
        }
    });

    daemon.wait().await
}
