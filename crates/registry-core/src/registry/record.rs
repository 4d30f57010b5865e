//! Instance records and the snapshot types handed out by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Opaque proof of the right to promote a reservation.
///
/// Generated from a random v4 UUID; compared as a plain string so a caller
/// presenting garbage simply gets a mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationToken(String);

impl ReservationToken {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ReservationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ReservationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored state of an identifier. Absence is represented by having no row.
#[derive(Debug, Clone)]
pub(crate) enum RecordState {
    Reserved {
        token: ReservationToken,
        expires_at: Instant,
    },
    Active {
        server_address: String,
        registered_at: DateTime<Utc>,
        activated_at: Instant,
        last_probe_success: Option<DateTime<Utc>>,
        generation: u64,
    },
}

/// One row of the registry table.
#[derive(Debug, Clone)]
pub(crate) struct InstanceRecord {
    pub(crate) identifier: String,
    pub(crate) state: RecordState,
}

impl InstanceRecord {
    pub(crate) fn reserved(identifier: &str, token: ReservationToken, expires_at: Instant) -> Self {
        Self {
            identifier: identifier.to_string(),
            state: RecordState::Reserved { token, expires_at },
        }
    }

    /// A reservation past its expiry is logically absent.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        matches!(self.state, RecordState::Reserved { expires_at, .. } if now >= expires_at)
    }

    pub(crate) fn view(&self) -> RecordView {
        match &self.state {
            RecordState::Reserved { expires_at, .. } => RecordView::Reserved {
                expires_at: *expires_at,
            },
            RecordState::Active {
                server_address,
                registered_at,
                activated_at,
                last_probe_success,
                generation,
            } => RecordView::Active(ActiveInstance {
                identifier: self.identifier.clone(),
                server_address: server_address.clone(),
                registered_at: *registered_at,
                last_probe_success: *last_probe_success,
                generation: *generation,
                activated_at: *activated_at,
            }),
        }
    }

    pub(crate) fn active_view(&self) -> Option<ActiveInstance> {
        match self.view() {
            RecordView::Active(active) => Some(active),
            RecordView::Reserved { .. } => None,
        }
    }
}

/// Owned copy of a record's visible state.
pub(crate) enum RecordView {
    Active(ActiveInstance),
    Reserved { expires_at: Instant },
}

/// Copy of an Active record at the moment it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveInstance {
    pub identifier: String,
    pub server_address: String,
    pub registered_at: DateTime<Utc>,
    pub last_probe_success: Option<DateTime<Utc>>,
    /// Distinguishes successive registrations of the same identifier.
    pub generation: u64,
    pub activated_at: Instant,
}

impl ActiveInstance {
    /// Time since promotion, used for the startup grace window.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.activated_at)
    }

    pub fn has_been_reachable(&self) -> bool {
        self.last_probe_success.is_some()
    }
}

/// A freshly granted reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub identifier: String,
    pub token: ReservationToken,
    pub expires_at: Instant,
}

impl Reservation {
    pub fn expires_in(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Result of `lookup`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Active(ActiveInstance),
    /// Someone holds an unexpired reservation; the holder is not disclosed.
    Reserved { expires_at: Instant },
    Absent,
}

/// Result of `reserve`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Granted(Reservation),
    AlreadyActive(ActiveInstance),
    AlreadyReserved { expires_at: Instant },
}

/// What `remove` deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedKind {
    Active,
    Reserved,
}

/// Why a liveness check removed an Active record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Failed after at least one successful probe.
    Unreachable,
    /// Never answered within the startup grace window.
    NeverReachable,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictReason::Unreachable => write!(f, "stopped responding"),
            EvictReason::NeverReachable => write!(f, "never became reachable"),
        }
    }
}

/// Decision applied atomically to an Active record after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    MarkReachable,
    Keep,
    Evict(EvictReason),
}
