//! Editor Registry - single-window-per-project arbitration for editor front-ends.
//!
//! A daemon keeps an in-memory table of which project identifiers have a live
//! editor window, probes those windows to evict dead ones, and hands out
//! reservations so two launchers opening the same project at once cannot both
//! spawn a window.
//!
//! This crate holds the registry itself, the JSON-RPC endpoint that exposes it
//! and the client used by launchers. The daemon binary lives in
//! `editor-registry-rpc`.
//!
//! # Example
//!
//! ```rust,ignore
//! use editor_registry::ipc::{Acquired, RegistryClient};
//! use editor_registry::RegistryConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> editor_registry::Result<()> {
//!     let client = RegistryClient::default();
//!     editor_registry::daemon::ensure_daemon(&client).await?;
//!
//!     match client
//!         .acquire("/work/project", RegistryConfig::CLAIM_POLL_INTERVAL, Duration::from_secs(20))
//!         .await?
//!     {
//!         Acquired::Existing(instance) => println!("focus {}", instance.server_address),
//!         Acquired::Claimed(reservation) => {
//!             // launch the editor, then:
//!             client
//!                 .register("/work/project", "127.0.0.1:51000", Some(&reservation.reservation_token))
//!                 .await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod liveness;
pub mod registry;
pub mod remote;
pub mod reservation;
pub mod service;
pub mod shutdown;

// Re-export commonly used types
pub use config::{RegistryConfig, RegistrySettings};
pub use error::{RegistryError, Result};
pub use liveness::{LivenessPolicy, LivenessProber, SweepReport};
pub use registry::{ActiveInstance, Lookup, RegistryStore, Reservation, ReservationToken};
pub use reservation::{Claim, ReservationProtocol};
pub use service::RegistryService;
pub use shutdown::{ShutdownListener, ShutdownSignal};
