//! Finding and starting the registry daemon.
//!
//! Clients call [`ensure_daemon`] before their first request. When nothing
//! answers on the endpoint, the daemon binary next to the current executable
//! is started detached, in its own process group with null stdio, and the
//! client waits until it accepts connections.

use crate::config::RegistryConfig;
use crate::ipc::RegistryClient;
use crate::{RegistryError, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Path of the daemon binary installed alongside the running executable.
pub fn locate_daemon_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        RegistryError::Internal(format!("{} has no parent directory", exe.display()))
    })?;
    let candidate = dir.join(daemon_file_name());
    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(RegistryError::Io {
            message: format!("Daemon binary not found at {}", candidate.display()),
            source: None,
        })
    }
}

fn daemon_file_name() -> String {
    format!("{}{}", RegistryConfig::DAEMON_BINARY, std::env::consts::EXE_SUFFIX)
}

/// Start `program` with `args`, detached from the caller.
///
/// The child gets null stdio and its own process group, so it survives the
/// caller's terminal closing. It is not waited on.
pub fn spawn_detached<I, S>(program: &Path, args: I) -> Result<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }

    let child = cmd.spawn().map_err(|e| RegistryError::Io {
        message: format!("Failed to start {}: {}", program.display(), e),
        source: Some(e),
    })?;
    let pid = child.id();
    info!("Started {} with PID {}", program.display(), pid);
    Ok(pid)
}

/// Poll until the endpoint accepts connections or `timeout` elapses.
pub async fn wait_until_reachable(client: &RegistryClient, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if client.is_reachable().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RegistryError::DaemonUnreachable {
                addr: client.addr().to_string(),
            });
        }
        tokio::time::sleep(RegistryConfig::DAEMON_START_POLL).await;
    }
}

/// Make sure a daemon is serving `client`'s endpoint, starting one if needed.
pub async fn ensure_daemon(client: &RegistryClient) -> Result<()> {
    if client.is_reachable().await {
        return Ok(());
    }
    ensure_daemon_with::<&str>(client, &locate_daemon_binary()?, &[]).await
}

/// Like [`ensure_daemon`], starting `binary` with `extra_args` after `--port`.
pub async fn ensure_daemon_with<S: AsRef<OsStr>>(
    client: &RegistryClient,
    binary: &Path,
    extra_args: &[S],
) -> Result<()> {
    if client.is_reachable().await {
        return Ok(());
    }

    debug!("No registry at {}, starting {}", client.addr(), binary.display());
    let port = client.addr().port().to_string();
    let args = [OsStr::new("--port"), OsStr::new(&port)]
        .into_iter()
        .chain(extra_args.iter().map(AsRef::as_ref));
    spawn_detached(binary, args)?;

    wait_until_reachable(client, RegistryConfig::DAEMON_START_TIMEOUT).await
}
