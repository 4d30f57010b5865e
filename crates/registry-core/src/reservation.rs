//! Find-or-claim reservation protocol.
//!
//! A caller that finds no instance does not just hear "not found": the same
//! atomic step reserves the identifier and hands back a token. Only the token
//! holder may register the instance, so two simultaneous launches cannot both
//! decide to spawn a window. Everyone else sees the reservation as pending and
//! polls until it is promoted or expires.
//!
//! ```text
//!   Absent ──reserve──▶ Reserved{token, expiry} ──promote(token)──▶ Active{address}
//!     ▲                    │ expiry / release                          │
//!     └────────────────────┴───────────── unregister / eviction ───────┘
//! ```

use crate::registry::{
    ActiveInstance, RegistryStore, RemovedKind, Reservation, ReservationToken, ReserveOutcome,
};
use crate::{RegistryError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of a find-or-claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// An instance is running; focus it.
    Existing(ActiveInstance),
    /// The caller now owns the right to launch and must promote or release.
    Granted(Reservation),
    /// Another caller is launching; poll again.
    Pending { expires_in: Duration },
}

/// Reservation protocol layered over the registry store.
#[derive(Debug, Clone)]
pub struct ReservationProtocol {
    store: Arc<RegistryStore>,
}

impl ReservationProtocol {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Return the running instance, or atomically reserve the identifier.
    pub fn find_or_claim(&self, identifier: &str) -> Claim {
        match self.store.reserve(identifier) {
            ReserveOutcome::Granted(reservation) => Claim::Granted(reservation),
            ReserveOutcome::AlreadyActive(active) => Claim::Existing(active),
            ReserveOutcome::AlreadyReserved { expires_at } => {
                debug!("Claim for {} is pending", identifier);
                Claim::Pending {
                    expires_in: expires_at.saturating_duration_since(Instant::now()),
                }
            }
        }
    }

    /// Register an instance address.
    ///
    /// With a token this promotes the caller's reservation. Without one it
    /// reserves and promotes in a single call, which only succeeds when the
    /// identifier is absent.
    pub fn register(
        &self,
        identifier: &str,
        server_address: &str,
        token: Option<&ReservationToken>,
    ) -> Result<ActiveInstance> {
        if let Some(token) = token {
            return self.store.promote(identifier, token, server_address);
        }

        match self.store.reserve(identifier) {
            ReserveOutcome::Granted(reservation) => {
                self.store
                    .promote(identifier, &reservation.token, server_address)
            }
            ReserveOutcome::AlreadyActive(_) => Err(RegistryError::DuplicateInstance {
                identifier: identifier.to_string(),
            }),
            ReserveOutcome::AlreadyReserved { .. } => Err(RegistryError::ReservationPending {
                identifier: identifier.to_string(),
            }),
        }
    }

    /// Give up a reservation without registering.
    pub fn release(&self, identifier: &str, token: &ReservationToken) -> Result<()> {
        self.store.release(identifier, token)
    }

    /// Remove whatever the identifier currently holds.
    pub fn unregister(&self, identifier: &str) -> Result<RemovedKind> {
        self.store.remove(identifier)
    }
}
