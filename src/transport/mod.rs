//! # Transport Layer
//!
//! Byte streams underneath the packet protocol.
//!
//! ## Components
//! - **Connection**: framed packet connection over any async stream, with close semantics
//! - **TLS**: optional TLS wrapping of TCP streams (rustls)

pub mod connection;
pub mod tls;
