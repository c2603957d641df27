//! # bridge-protocol
//!
//! Async client core for a device debug-bridge transport: the protocol that
//! multiplexes arbitrarily many ordered, reliable logical streams (shell
//! sessions, file sync, port forwarding) over one physical channel — USB,
//! TCP, or a relay socket — with public-key authentication and no native
//! daemon doing the multiplexing.
//!
//! ## Layers
//! - [`core`] — packet framing, the stream codec, banner/feature parsing
//! - [`auth`] — RSA credentials, challenge signing, the key store
//! - [`protocol`] — the connect/auth handshake and the stream dispatcher
//! - [`transport`] — packet framing over byte-duplex channels
//!
//! ## Usage
//! ```no_run
//! use bridge_protocol::config::BridgeConfig;
//! use bridge_protocol::auth::KeyStore;
//! use bridge_protocol::{protocol, transport};
//!
//! # async fn run() -> bridge_protocol::error::Result<()> {
//! let config = BridgeConfig::default_with_overrides(|c| {
//!     c.transport.address = "192.168.1.20:5555".into();
//! });
//! let store = KeyStore::open(&config.auth.key_dir, &config.auth.key_name)?;
//!
//! let mut conn = transport::connect_tcp(&config.transport).await?;
//! let session = protocol::establish(&mut conn, &config, &store).await?;
//! let dispatcher = protocol::dispatcher::start(conn, session);
//!
//! let mut shell = dispatcher.open("shell:echo hi").await?;
//! while let Some(chunk) = shell.read().await? {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use protocol::{DispatcherHandle, SessionInfo, StreamEvent, StreamHandle};
