//! Daemon assembly: store, service, endpoint and background sweep.

use editor_registry::ipc::{IpcServer, IpcServerHandle};
use editor_registry::remote::Probe;
use editor_registry::{RegistrySettings, RegistryService, RegistryStore, ShutdownSignal};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// A bound, serving daemon.
pub struct RunningDaemon {
    server: IpcServerHandle,
    sweep: JoinHandle<()>,
    shutdown: ShutdownSignal,
}

impl RunningDaemon {
    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Wait until shutdown has been requested and everything has drained.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.server.join().await?;
        self.sweep.await?;
        info!("Registry stopped");
        Ok(())
    }
}

/// Bind the endpoint and start the sweep.
///
/// Returns once the listener is bound, so bind failures surface here.
pub async fn start_daemon(
    settings: &RegistrySettings,
    probe: Arc<dyn Probe>,
) -> anyhow::Result<RunningDaemon> {
    let shutdown = ShutdownSignal::new();
    let store = Arc::new(RegistryStore::new(settings));
    let service = Arc::new(RegistryService::new(
        store,
        probe,
        settings,
        shutdown.clone(),
    ));

    let server = IpcServer::bind(settings.endpoint(), service.clone(), shutdown.clone()).await?;
    let sweep = tokio::spawn(
        service
            .prober()
            .run(settings.sweep_interval, shutdown.subscribe()),
    );

    Ok(RunningDaemon {
        server,
        sweep,
        shutdown,
    })
}
