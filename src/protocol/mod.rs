//! # Session Protocol
//!
//! Everything between decoded packets and the client/server services.
//!
//! ## Components
//! - **Handshake**: token authentication exchange
//! - **Dispatcher**: per-kind routing of received packets
//! - **Listener**: append-only listener lists with snapshot iteration
//! - **State**: session lifecycle states
//! - **Token**: token providers and constant-time comparison

pub mod dispatcher;
pub mod handshake;
pub mod listener;
pub mod state;
pub mod token;
