//! # Core Protocol Components
//!
//! Low-level packet handling: the packet model, the id registry and the framing
//! codec.
//!
//! ## Components
//! - **Packet**: built-in packet bodies and the extensible [`packet::Packet`] enum
//! - **Registry**: id to packet kind mapping with one-way lock switches
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Id(1)] [Payload(Length - 1)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation
//! - Built-in packets can't be shadowed or unregistered

pub mod codec;
pub mod packet;
pub mod registry;
