//! Neovim remote control via `nvim --server <addr> --remote-expr <expr>`.

use super::{Focus, Probe, ProbeResult};
use crate::{RegistryError, Result};
use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Expression evaluated to check that the server answers.
const PING_EXPR: &str = "1";
/// Expression that asks a Neovide front-end to raise its window.
const FOCUS_EXPR: &str = "execute('NeovideFocus')";

/// Default bound for `focus`, which has no caller-supplied timeout.
const FOCUS_TIMEOUT: Duration = Duration::from_secs(3);

/// Talks to a Neovim server through the `nvim` client binary.
#[derive(Debug, Clone)]
pub struct NvimRemote {
    program: OsString,
    focus_timeout: Duration,
}

impl Default for NvimRemote {
    fn default() -> Self {
        Self::new("nvim")
    }
}

impl NvimRemote {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            focus_timeout: FOCUS_TIMEOUT,
        }
    }

    pub fn with_focus_timeout(mut self, timeout: Duration) -> Self {
        self.focus_timeout = timeout;
        self
    }

    /// Evaluate `expr` on the server at `address`.
    ///
    /// Returns `Ok(true)` when the client exits successfully.
    async fn remote_expr(&self, address: &str, expr: &str, timeout: Duration) -> Result<bool> {
        let mut command = Command::new(&self.program);
        command
            .args(["--server", address, "--remote-expr", expr])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| RegistryError::Timeout(timeout))?
            .map_err(|e| RegistryError::LivenessFailure {
                address: address.to_string(),
                message: format!("failed to run {:?}: {}", self.program, e),
            })?;

        Ok(output.status.success())
    }
}

#[async_trait::async_trait]
impl Probe for NvimRemote {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeResult {
        match self.remote_expr(address, PING_EXPR, timeout).await {
            Ok(true) => ProbeResult::Reachable,
            Ok(false) => {
                debug!("nvim server {} did not answer", address);
                ProbeResult::Unreachable
            }
            Err(RegistryError::Timeout(_)) => {
                debug!("nvim probe to {} timed out", address);
                ProbeResult::Failed
            }
            Err(e) => {
                warn!("nvim probe could not run: {}", e);
                ProbeResult::Failed
            }
        }
    }
}

#[async_trait::async_trait]
impl Focus for NvimRemote {
    async fn focus(&self, address: &str) -> Result<()> {
        match self.remote_expr(address, FOCUS_EXPR, self.focus_timeout).await {
            Ok(true) => {
                debug!("Focused instance at {}", address);
                Ok(())
            }
            Ok(false) => Err(RegistryError::LivenessFailure {
                address: address.to_string(),
                message: "focus request was rejected".to_string(),
            }),
            Err(RegistryError::Timeout(timeout)) => Err(RegistryError::LivenessFailure {
                address: address.to_string(),
                message: format!("no answer to focus request within {:?}", timeout),
            }),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_fails_probe() {
        let remote = NvimRemote::new("/nonexistent/bin/nvim");
        let result = remote.probe("127.0.0.1:1", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn test_missing_binary_focus_is_liveness_failure() {
        let remote = NvimRemote::new("/nonexistent/bin/nvim");
        let err = remote.focus("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, RegistryError::LivenessFailure { .. }));
        assert_eq!(err.to_rpc_error_code(), -32003);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_decides_reachability() {
        let ok = NvimRemote::new("true");
        assert_eq!(
            ok.probe("127.0.0.1:1", Duration::from_secs(5)).await,
            ProbeResult::Reachable
        );

        let refused = NvimRemote::new("false");
        assert_eq!(
            refused.probe("127.0.0.1:1", Duration::from_secs(5)).await,
            ProbeResult::Unreachable
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unresponsive_focus_is_liveness_failure() {
        use std::os::unix::fs::PermissionsExt;

        let script = std::env::temp_dir().join(format!(
            "editor-registry-hung-nvim-{}.sh",
            std::process::id()
        ));
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let remote = NvimRemote::new(&script).with_focus_timeout(Duration::from_millis(200));
        let err = remote.focus("127.0.0.1:1").await.unwrap_err();
        let _ = std::fs::remove_file(&script);

        assert!(matches!(err, RegistryError::LivenessFailure { .. }));
        assert_eq!(err.to_rpc_error_code(), -32003);
    }
}
