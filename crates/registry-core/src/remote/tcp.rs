//! Plain TCP connect probe.

use super::{Probe, ProbeResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Considers an address alive when a TCP connection to it succeeds.
///
/// Works for any editor whose control endpoint is a TCP listener and needs no
/// external binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait::async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeResult {
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => ProbeResult::Reachable,
            Ok(Err(e)) => {
                debug!("TCP probe to {} refused: {}", address, e);
                ProbeResult::Unreachable
            }
            Err(_) => {
                debug!("TCP probe to {} timed out", address);
                ProbeResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_listening_socket_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let result = TcpProbe.probe(&addr, Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Reachable);
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_not_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpProbe.probe(&addr, Duration::from_millis(500)).await;
        assert!(!result.is_reachable());
    }
}
