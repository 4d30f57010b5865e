//! Capabilities for talking to a registered editor instance.
//!
//! The registry never depends on a specific editor. It is handed a `Probe`
//! to answer "is this address still alive", and clients are handed a `Focus`
//! to bring an existing window forward. Both are async traits so tests can
//! substitute scripted fakes.

pub mod nvim;
pub mod tcp;

pub use nvim::NvimRemote;
pub use tcp::TcpProbe;

use crate::Result;
use std::time::Duration;

/// Result of a single reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The instance answered.
    Reachable,
    /// The instance refused or answered negatively.
    Unreachable,
    /// The probe could not complete (spawn failure, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_reachable(self) -> bool {
        self == ProbeResult::Reachable
    }
}

/// "Is this address still alive?"
#[async_trait::async_trait]
pub trait Probe: Send + Sync + 'static {
    /// Probe `address`, giving up after roughly `timeout`.
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeResult;
}

/// Bring the window behind `address` to the foreground.
#[async_trait::async_trait]
pub trait Focus: Send + Sync + 'static {
    async fn focus(&self, address: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_reachable_counts_as_alive() {
        assert!(ProbeResult::Reachable.is_reachable());
        assert!(!ProbeResult::Unreachable.is_reachable());
        assert!(!ProbeResult::Failed.is_reachable());
    }
}
