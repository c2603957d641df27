//! # Protocol Drivers
//!
//! The stateful half of the crate: the connection handshake and the stream
//! dispatcher that owns the connection afterward.
//!
//! ## Components
//! - **Handshake**: drives the connect/auth exchange to a `Connected`
//!   session, retrying stored credentials and falling back to generating a
//!   key pair live
//! - **Dispatcher**: the actor owning the connection in steady state,
//!   multiplexing logical streams with flow control
//! - **Stream handles**: the consumer-facing boundary layered protocols
//!   (shell, file sync) build on

pub mod dispatcher;
pub mod handshake;
pub mod socket;

pub use dispatcher::DispatcherHandle;
pub use handshake::{establish, SessionInfo};
pub use socket::{StreamEvent, StreamHandle};
