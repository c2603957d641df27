//! # Utility Modules
//!
//! Supporting utilities shared across the transport implementation.
//!
//! ## Components
//! - **Logging**: structured logging configuration via `tracing-subscriber`

pub mod logging;
