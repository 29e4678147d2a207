//! Token authentication handshake.
//!
//! ```text
//! client                         server
//!   | --- Auth { token } ---------> |   first packet, within the handshake deadline
//!   | <-- AuthSuccess ------------- |   token matches
//!   | <-- Disconnect { reason } --- |   token mismatch, connection then closes
//! ```
//!
//! Both functions run on a freshly opened [`Connection`] before any other
//! packet is exchanged. Neither closes the connection; the owning session does.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::packet::{Auth, Packet};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::token::{tokens_match, TokenProvider};
use crate::transport::connection::Connection;
use crate::utils::timeout::with_optional_timeout;

/// Client side: send `token` and wait for the verdict.
///
/// A `Disconnect` answer becomes [`ProtocolError::AuthRejected`] carrying the
/// server's reason.
#[instrument(skip_all)]
pub async fn client_handshake(connection: &Connection, token: &str) -> Result<()> {
    connection.send(Packet::auth(token)).await?;

    match connection.recv().await? {
        Some(Packet::AuthSuccess(_)) => {
            debug!("Server accepted token");
            Ok(())
        }
        Some(Packet::Disconnect(disconnect)) => {
            warn!(reason = %disconnect.reason, "Server rejected the connection");
            Err(ProtocolError::AuthRejected(disconnect.reason))
        }
        Some(other) => Err(ProtocolError::violation(format!(
            "{}: {}",
            constants::ERR_INVALID_AUTH_RESPONSE,
            other.name()
        ))),
        None => Err(ProtocolError::ConnectionClosed),
    }
}

/// Server side: wait for the client's `Auth` and check it against the
/// provider's current token.
///
/// On mismatch a `Disconnect("Received invalid token")` is sent (best effort)
/// and [`ProtocolError::AuthRejected`] returned. A first packet of any other
/// kind is a protocol violation. `deadline` bounds the wait for that first
/// packet; expiry yields [`ProtocolError::Timeout`].
#[instrument(skip_all)]
pub async fn server_handshake(
    connection: &Connection,
    provider: &dyn TokenProvider,
    deadline: Option<Duration>,
) -> Result<Auth> {
    let auth = match with_optional_timeout(connection.recv(), deadline).await? {
        Some(Packet::Auth(auth)) => auth,
        Some(other) => {
            return Err(ProtocolError::violation(format!(
                "{}: {}",
                constants::ERR_INVALID_AUTH_PACKET,
                other.name()
            )))
        }
        None => return Err(ProtocolError::ConnectionClosed),
    };

    let expected = provider.provide();
    if !tokens_match(&expected, &auth.token) {
        warn!("Client offered an invalid token");
        connection
            .send_before_close(Packet::disconnect(constants::ERR_INVALID_TOKEN))
            .await;
        return Err(ProtocolError::AuthRejected(
            constants::ERR_INVALID_TOKEN.into(),
        ));
    }

    connection.send(Packet::auth_success()).await?;
    debug!("Client authenticated");
    Ok(auth)
}
