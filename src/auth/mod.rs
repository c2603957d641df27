//! # Credential Engine
//!
//! RSA key material for answering authentication challenges.
//!
//! The handshake only ever sees derived artifacts — signatures and the
//! custom public-key payload — never raw key material. Keys are persisted as
//! PKCS#8 PEM files in a configured directory and tried in a stable order
//! (most recently used first) on each handshake attempt.
//!
//! ## Components
//! - **Credential**: one 2048-bit RSA key pair plus its human-readable name
//! - **KeyStore**: persisted-key iteration and write-through persistence
//! - **mod_inverse**: the extended-Euclid helper behind the Montgomery
//!   constant in the public-key encoding

pub mod key;
pub mod store;

pub use key::{mod_inverse, Credential};
pub use store::KeyStore;
