#![forbid(unsafe_code)]
//! Asynchronous broker sharing hardware communication adapters between
//! client processes.
//!
//! Many client processes may want the same physical adapter at once. The
//! broker owns every adapter, reference counts the physical open and online
//! transitions per client, offers an advisory lock with a bounded hold time,
//! and moves bulk traffic between each adapter and per-client mailboxes.
//!
//! # Overview
//!
//! - [`registry::DeviceRegistry`] discovers adapters through a
//!   [`adapter::Backend`] and keeps one [`context::DeviceContext`] per serial.
//! - A device context physically opens its adapter when the first client
//!   opens it and closes it when the last one closes it. Online/offline works
//!   the same way.
//! - [`timed_lock::TimedLock`] grants the device lock to one client at a time
//!   and releases it on unlock or after the requested duration.
//! - [`relay`] moves messages between the adapter's raw stream and
//!   [`mailbox::Mailbox`] endpoints, splitting messages larger than one
//!   mailbox frame.
//! - [`session::Session`] serves one client connection and releases whatever
//!   it acquired when the connection ends.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hwbroker::{
//!     loopback::LoopbackBackend,
//!     mailbox::LocalMailboxes,
//!     registry::DeviceRegistry,
//!     srv::{Server, ServerConfig, srv_async},
//!     Result,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig::default();
//!     let backend = Arc::new(LoopbackBackend::with_serials(&["A", "B"]));
//!     let registry = Arc::new(DeviceRegistry::new(backend, config.relay.clone()));
//!     let server = Server::new(registry.clone(), Arc::new(LocalMailboxes::default()), &config);
//!
//!     srv_async(&server, "tcp!0.0.0.0!54949").await?;
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Protocol
//!
//! Every request starts with a one-byte opcode followed by its fields.
//! Integers are little-endian and strings carry a `u16` length prefix.
//! Messages are not framed, so an unknown opcode ends the connection. See
//! [`rpc::Opcode`] for the request set and [`rpc::Response`] for the answer
//! shapes.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!54949"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
pub mod adapter;
pub mod client;
pub mod codec;
pub mod context;
pub mod error;
pub mod loopback;
pub mod mailbox;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod serialize;
pub mod session;
pub mod srv;
pub mod timed_lock;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::rpc::*;
pub use crate::utils::Result;
