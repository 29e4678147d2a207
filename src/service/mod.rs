//! # Services
//!
//! The two ends of a command session.
//!
//! ## Components
//! - **Client**: connects, authenticates and keeps the session alive
//! - **Server**: accepts, authenticates and serves clients from a bounded pool
//! - **Session**: the server's handle on one connected client

pub mod client;
pub mod server;
pub mod session;
