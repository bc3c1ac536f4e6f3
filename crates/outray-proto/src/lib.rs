//! Outray control-connection protocol
//!
//! This crate defines the JSON frames exchanged between a tunnel client and the
//! Outray relay over the single WebSocket control connection, plus the base64
//! helpers used for byte payloads.

pub mod encoding;
pub mod error;
pub mod messages;

pub use error::ProtoError;
pub use messages::*;

/// Default relay endpoint
pub const DEFAULT_SERVER_URL: &str = "wss://api.outray.dev";
