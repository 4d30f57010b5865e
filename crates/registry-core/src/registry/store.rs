//! The authoritative in-memory instance table.
//!
//! Records live in a sharded `DashMap`. Every operation on one identifier
//! goes through that identifier's entry, so it holds the shard lock for the
//! whole read-modify-write and never across I/O. Operations on identifiers in
//! different shards run in parallel.

use super::record::{
    ActiveInstance, InstanceRecord, Lookup, ProbeAction, RecordState, RecordView, RemovedKind,
    Reservation, ReservationToken, ReserveOutcome,
};
use crate::config::RegistrySettings;
use crate::{RegistryError, Result};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// In-memory registry of editor instances keyed by identifier.
#[derive(Debug)]
pub struct RegistryStore {
    records: DashMap<String, InstanceRecord>,
    reservation_ttl: Duration,
    next_generation: AtomicU64,
}

impl RegistryStore {
    pub fn new(settings: &RegistrySettings) -> Self {
        Self::with_ttl(settings.reservation_ttl)
    }

    pub fn with_ttl(reservation_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            reservation_ttl,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Read the current state of an identifier, purging it if it is an
    /// expired reservation.
    pub fn lookup(&self, identifier: &str) -> Lookup {
        let now = Instant::now();
        match self.records.entry(identifier.to_string()) {
            Entry::Vacant(_) => Lookup::Absent,
            Entry::Occupied(entry) => {
                if entry.get().is_expired(now) {
                    entry.remove();
                    debug!("Purged expired reservation for {}", identifier);
                    return Lookup::Absent;
                }
                match entry.get().view() {
                    RecordView::Active(active) => Lookup::Active(active),
                    RecordView::Reserved { expires_at } => Lookup::Reserved { expires_at },
                }
            }
        }
    }

    /// Claim an identifier if, and only if, it is currently absent.
    ///
    /// An expired reservation counts as absent and is replaced in place.
    pub fn reserve(&self, identifier: &str) -> ReserveOutcome {
        let now = Instant::now();
        let expires_at = now + self.reservation_ttl;

        match self.records.entry(identifier.to_string()) {
            Entry::Vacant(entry) => {
                let token = ReservationToken::generate();
                entry.insert(InstanceRecord::reserved(identifier, token.clone(), expires_at));
                debug!("Reserved {} for {:?}", identifier, self.reservation_ttl);
                ReserveOutcome::Granted(Reservation {
                    identifier: identifier.to_string(),
                    token,
                    expires_at,
                })
            }
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    let token = ReservationToken::generate();
                    entry.insert(InstanceRecord::reserved(identifier, token.clone(), expires_at));
                    info!("Replaced abandoned reservation for {}", identifier);
                    return ReserveOutcome::Granted(Reservation {
                        identifier: identifier.to_string(),
                        token,
                        expires_at,
                    });
                }
                match entry.get().view() {
                    RecordView::Active(active) => ReserveOutcome::AlreadyActive(active),
                    RecordView::Reserved { expires_at } => {
                        ReserveOutcome::AlreadyReserved { expires_at }
                    }
                }
            }
        }
    }

    /// Turn a reservation into an Active record.
    ///
    /// Fails with `ReservationInvalid` unless the stored record is a
    /// reservation with the same, unexpired token, and with
    /// `DuplicateInstance` if the identifier is already Active.
    pub fn promote(
        &self,
        identifier: &str,
        token: &ReservationToken,
        server_address: &str,
    ) -> Result<ActiveInstance> {
        let now = Instant::now();
        let invalid = || RegistryError::ReservationInvalid {
            identifier: identifier.to_string(),
        };

        match self.records.entry(identifier.to_string()) {
            Entry::Vacant(_) => Err(invalid()),
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    entry.remove();
                    debug!("Rejected promotion of expired reservation for {}", identifier);
                    return Err(invalid());
                }
                let token_matches = match &entry.get().state {
                    RecordState::Active { .. } => {
                        return Err(RegistryError::DuplicateInstance {
                            identifier: identifier.to_string(),
                        })
                    }
                    RecordState::Reserved { token: held, .. } => held == token,
                };
                if !token_matches {
                    return Err(invalid());
                }

                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let record = entry.get_mut();
                record.state = RecordState::Active {
                    server_address: server_address.to_string(),
                    registered_at: Utc::now(),
                    activated_at: now,
                    last_probe_success: None,
                    generation,
                };
                info!("Registered instance {} at {}", identifier, server_address);
                record.active_view().ok_or_else(invalid)
            }
        }
    }

    /// Delete an Active or Reserved record.
    pub fn remove(&self, identifier: &str) -> Result<RemovedKind> {
        let now = Instant::now();
        match self.records.remove(identifier) {
            Some((_, record)) if record.is_expired(now) => Err(RegistryError::NotFound {
                identifier: identifier.to_string(),
            }),
            Some((_, record)) => {
                let kind = match record.state {
                    RecordState::Active { .. } => RemovedKind::Active,
                    RecordState::Reserved { .. } => RemovedKind::Reserved,
                };
                info!("Removed {:?} record for {}", kind, identifier);
                Ok(kind)
            }
            None => Err(RegistryError::NotFound {
                identifier: identifier.to_string(),
            }),
        }
    }

    /// Give up a reservation held with `token`.
    pub fn release(&self, identifier: &str, token: &ReservationToken) -> Result<()> {
        let now = Instant::now();
        match self.records.entry(identifier.to_string()) {
            Entry::Vacant(_) => Err(RegistryError::NotFound {
                identifier: identifier.to_string(),
            }),
            Entry::Occupied(entry) => {
                if entry.get().is_expired(now) {
                    entry.remove();
                    return Err(RegistryError::NotFound {
                        identifier: identifier.to_string(),
                    });
                }
                let holds_token = matches!(
                    &entry.get().state,
                    RecordState::Reserved { token: held, .. } if held == token
                );
                if !holds_token {
                    return Err(RegistryError::ReservationInvalid {
                        identifier: identifier.to_string(),
                    });
                }
                entry.remove();
                info!("Released reservation for {}", identifier);
                Ok(())
            }
        }
    }

    /// All Active records. Reservations are never listed.
    pub fn list(&self) -> Vec<ActiveInstance> {
        self.records
            .iter()
            .filter_map(|entry| entry.value().active_view())
            .collect()
    }

    /// Apply a probe decision to the record the probe was computed for.
    ///
    /// `decide` runs under the entry lock against the current record. Returns
    /// `None` when the identifier no longer holds the same Active generation,
    /// in which case nothing is changed.
    pub fn resolve_probe<F>(&self, identifier: &str, generation: u64, decide: F) -> Option<ProbeAction>
    where
        F: FnOnce(&ActiveInstance) -> ProbeAction,
    {
        let Entry::Occupied(mut entry) = self.records.entry(identifier.to_string()) else {
            return None;
        };
        let current = entry.get().active_view()?;
        if current.generation != generation {
            return None;
        }

        let action = decide(&current);
        match action {
            ProbeAction::MarkReachable => {
                if let RecordState::Active {
                    last_probe_success, ..
                } = &mut entry.get_mut().state
                {
                    *last_probe_success = Some(Utc::now());
                }
            }
            ProbeAction::Keep => {}
            ProbeAction::Evict(_) => {
                entry.remove();
            }
        }
        Some(action)
    }

    /// Drop every reservation past its expiry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.records.retain(|_, record| {
            let expired = record.is_expired(now);
            if expired {
                purged += 1;
            }
            !expired
        });
        purged
    }

    /// Number of rows, expired reservations included until purged.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
