//! Local JSON-RPC endpoint of the registry.
//!
//! Newline-delimited JSON-RPC 2.0 over `127.0.0.1` TCP.
//!
//! # Architecture
//!
//! - **Server**: runs in the daemon, accepts connections, dispatches method calls
//! - **Client**: used by launchers and the control CLI, one connection per call
//! - **Protocol**: framing, envelopes and the typed params/results of each method

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{Acquired, RegistryClient};
pub use protocol::{GrantedReservation, InstanceSummary, IpcRequest, IpcResponse, QueryResult};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
