//! Concurrent TFTP (RFC 1350) server
//!
//! A lock-step, block-oriented UDP file server:
//! - Read requests (RRQ) served from a configurable GET directory
//! - Write requests (WRQ) stored into a configurable PUT directory
//! - Binary (octet) and text (netascii) transfer modes, serviced
//!   identically; `mail` is rejected
//! - One ephemeral-port session per transfer, up to 16 concurrent
//!   sessions per server, with per-block timeout and retransmit
//! - Duplicate request suppression through an active-connection table
//!
//! # Server usage
//!
//! ```rust,no_run
//! use tftp::{ServerConfig, start_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = start_server(ServerConfig::new("/srv/tftp", "/srv/incoming")).await?;
//!     println!("serving on port {}", handle.local_port());
//!     handle.join().await;
//!     Ok(())
//! }
//! ```
//!
//! Up to [`MAX_SERVERS`] instances may run concurrently in one process,
//! each bound to its own port. Stopping a server via
//! [`ServerHandle::stop`] refuses new sessions; transfers already in
//! flight complete on their own endpoints.
//!
//! Option extensions (RFC 2347/2348/2349), IPv6, and netascii line-ending
//! translation are not implemented.

pub mod endpoint;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
mod transfer;

pub use endpoint::{Endpoint, PeerFilter};
pub use protocol::*;
pub use registry::{ConnectionRegistry, MAX_CONNECTIONS};
pub use server::{MAX_SERVERS, MAX_SESSIONS, NO_ERROR, ServerConfig, ServerHandle, TFTP_SERVER_PORT, start_server};
pub use store::BlobStore;
pub use transfer::{RECV_ATTEMPTS, RECV_TIMEOUT};
