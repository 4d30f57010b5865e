//! In-memory instance registry.
//!
//! This module owns the table of instance records:
//! - **Reserved** rows: an identifier someone is about to launch, guarded by a
//!   token with an expiry
//! - **Active** rows: a running editor and the address of its control endpoint
//!
//! Absence is the lack of a row. The store is the only place records are
//! mutated; everything else works on owned snapshots.

pub mod record;
pub mod store;

pub use record::{
    ActiveInstance, EvictReason, Lookup, ProbeAction, RemovedKind, Reservation, ReservationToken,
    ReserveOutcome,
};
pub use store::RegistryStore;
