//! Liveness probing of Active records.
//!
//! A record that has answered once and then stops answering is evicted on the
//! first failure. A record that has never answered is tolerated for the
//! startup grace window, measured from promotion, and evicted after it.
//!
//! Probes run without any store lock held. The decision is applied afterwards
//! through `RegistryStore::resolve_probe`, which ignores the result if the
//! identifier was re-registered while the probe was in flight.

use crate::config::RegistrySettings;
use crate::registry::{ActiveInstance, EvictReason, ProbeAction, RegistryStore};
use crate::remote::{Probe, ProbeResult};
use crate::shutdown::ShutdownListener;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Eviction rules applied to a probe result.
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub startup_grace: Duration,
}

impl LivenessPolicy {
    pub fn new(startup_grace: Duration) -> Self {
        Self { startup_grace }
    }

    /// Decide what to do with `instance` given one probe result.
    ///
    /// A probe that could not run at all counts as a failure.
    pub fn assess(&self, instance: &ActiveInstance, result: ProbeResult, now: Instant) -> ProbeAction {
        if result.is_reachable() {
            ProbeAction::MarkReachable
        } else if instance.has_been_reachable() {
            ProbeAction::Evict(EvictReason::Unreachable)
        } else if instance.age(now) >= self.startup_grace {
            ProbeAction::Evict(EvictReason::NeverReachable)
        } else {
            ProbeAction::Keep
        }
    }
}

/// Counters from one background sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: usize,
    pub reservations_purged: usize,
}

/// Probes Active records and evicts the dead ones.
pub struct LivenessProber {
    store: Arc<RegistryStore>,
    probe: Arc<dyn Probe>,
    policy: LivenessPolicy,
    timeout: Duration,
}

impl LivenessProber {
    pub fn new(store: Arc<RegistryStore>, probe: Arc<dyn Probe>, settings: &RegistrySettings) -> Self {
        Self {
            store,
            probe,
            policy: LivenessPolicy::new(settings.startup_grace),
            timeout: settings.probe_timeout,
        }
    }

    /// Probe one instance and apply the policy.
    ///
    /// Returns the applied action, or `None` when the record changed while
    /// the probe was outstanding and the result was discarded.
    pub async fn check(&self, instance: &ActiveInstance) -> Option<ProbeAction> {
        let result = self.probe.probe(&instance.server_address, self.timeout).await;
        let now = Instant::now();
        let policy = self.policy;

        let applied = self
            .store
            .resolve_probe(&instance.identifier, instance.generation, |current| {
                policy.assess(current, result, now)
            });

        match applied {
            Some(ProbeAction::Evict(reason)) => warn!(
                "Evicted {} at {}: {}",
                instance.identifier, instance.server_address, reason
            ),
            Some(ProbeAction::MarkReachable) | Some(ProbeAction::Keep) => {}
            None => debug!(
                "Discarded stale probe result for {}",
                instance.identifier
            ),
        }
        applied
    }

    /// Probe every Active record concurrently and purge expired reservations.
    pub async fn sweep(&self) -> SweepReport {
        let instances = self.store.list();
        let actions = join_all(instances.iter().map(|instance| self.check(instance))).await;

        let evicted = actions
            .iter()
            .filter(|action| matches!(action, Some(ProbeAction::Evict(_))))
            .count();
        let reservations_purged = self.store.purge_expired();
        if reservations_purged > 0 {
            debug!("Purged {} expired reservations", reservations_purged);
        }

        SweepReport {
            probed: instances.len(),
            evicted,
            reservations_purged,
        }
    }

    /// Sweep every `interval` until shutdown is requested.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownListener) {
        info!("Liveness sweep started (every {:?})", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.sweep().await;
                    if report.evicted > 0 {
                        info!("Sweep evicted {} of {} instances", report.evicted, report.probed);
                    }
                }
                _ = shutdown.wait() => {
                    debug!("Liveness sweep shutting down");
                    break;
                }
            }
        }
    }
}
