//! # Command Protocol
//!
//! Authenticated command sessions over TCP or TLS.
//!
//! A [`CommandServer`] accepts clients that present a shared token. Once
//! authorized, either side may send named commands with string arguments,
//! answer with opaque response data, or exchange application-defined packets
//! registered in a [`PacketRegistry`]. Clients keep sessions alive with
//! periodic pings and drop the connection when a ping goes unanswered.
//!
//! ## Wire format
//!
//! ```text
//! +----------------+--------+------------------+
//! | length: i32 BE | id: u8 | payload          |
//! +----------------+--------+------------------+
//!                   \___ length bytes _________/
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use command_protocol::{ClientConnection, CommandServer, Result, ServerListener};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ServerListener for Echo {
//!     async fn command_received(
//!         &self,
//!         connection: &ClientConnection,
//!         command: &str,
//!         args: &[String],
//!     ) -> Result<()> {
//!         connection.respond(format!("{command} {}", args.join(" ")).into_bytes()).await
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let server = CommandServer::new("127.0.0.1", 7561, "secret-token");
//! server.add_listener(Arc::new(Echo));
//! server.start().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::codec::PacketCodec;
pub use crate::core::packet::{CustomPacket, Packet, PacketBody};
pub use crate::core::registry::PacketRegistry;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::state::SessionState;
pub use crate::protocol::token::{FixedTokenProvider, TokenProvider};
pub use crate::service::client::{ClientListener, CommandClient};
pub use crate::service::server::{CommandServer, ServerListener};
pub use crate::service::session::ClientConnection;
