//! # Core Wire Types
//!
//! The framing layer of the bridge transport: packet structures, the
//! 24-byte header codec, banner parsing, and the negotiated feature set.
//!
//! Everything in this module is pure data manipulation; policy (when to
//! validate checksums, how to route) lives in [`crate::protocol`].

pub mod banner;
pub mod codec;
pub mod packet;
