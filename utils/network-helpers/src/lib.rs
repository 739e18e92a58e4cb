//! # Network helpers
//!
//! Shared socket plumbing for the relay roles: listener openers with the
//! socket options the relay depends on, and the engineer-side WebSocket layer
//! (protocol sniffing, TLS termination, RFC 6455 framing).

pub mod socket;
pub mod websocket;
