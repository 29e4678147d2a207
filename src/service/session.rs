//! Server-side view of one connected client.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, instrument};

use crate::core::packet::{Command, CommandResponse, CustomPacket, Disconnect, Packet, Ping};
use crate::error::Result;
use crate::protocol::dispatcher::{Dispatcher, PacketReceiver};
use crate::protocol::handshake::server_handshake;
use crate::service::server::{CommandServer, ServerInner};
use crate::transport::connection::Connection;

/// One accepted client session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    connection: Arc<Connection>,
    server: Arc<ServerInner>,
    authenticated: AtomicBool,
    disconnect_reason: Mutex<Option<String>>,
}

impl ClientConnection {
    pub(crate) fn new(id: u64, connection: Arc<Connection>, server: Arc<ServerInner>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                connection,
                server,
                authenticated: AtomicBool::new(false),
                disconnect_reason: Mutex::new(None),
            }),
        }
    }

    /// Server-assigned id, unique for the lifetime of the server
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.connection.peer_addr()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.connection.is_closed()
    }

    /// Reason sent by the client in its Disconnect packet, if it sent one
    pub fn disconnect_reason(&self) -> Option<String> {
        self.inner
            .disconnect_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The server that accepted this client
    pub fn server(&self) -> CommandServer {
        CommandServer::from_inner(self.inner.server.clone())
    }

    /// Answer a command received from this client
    pub async fn respond(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_packet(Packet::response(data)).await
    }

    pub async fn send_command<I, S>(&self, name: impl Into<String>, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send_packet(Packet::command(name, args)).await
    }

    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.inner.connection.send(packet).await
    }

    /// Send the reason to the client (best effort) and close
    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        info!(client = self.inner.id, %reason, "Disconnecting client");
        self.inner
            .connection
            .send_before_close(Packet::disconnect(reason))
            .await;
        self.close().await;
        Ok(())
    }

    pub async fn close(&self) {
        self.inner.connection.close().await;
    }

    /// Authenticate the client, then dispatch its packets until the
    /// connection closes
    #[instrument(skip(self), fields(client = self.inner.id))]
    pub(crate) async fn handle(&self) -> Result<()> {
        let server = &self.inner.server;
        let connection = &self.inner.connection;

        server.metrics.auth_attempt();
        let provider = server.token_provider();
        if let Err(e) = server_handshake(connection, provider.as_ref(), server.handshake_timeout).await
        {
            server.metrics.auth_failed();
            return Err(e);
        }
        self.inner.authenticated.store(true, Ordering::SeqCst);
        server.metrics.auth_accepted();
        info!(peer = ?self.peer_addr(), "Client authorized");

        for listener in server.listeners.snapshot() {
            listener.client_authorized(self).await?;
        }

        let dispatcher = Dispatcher::new(SessionReceiver(self)).with_metrics(server.metrics.clone());
        while let Some(packet) = connection.recv().await? {
            dispatcher.dispatch(packet).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.peer_addr())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

struct SessionReceiver<'a>(&'a ClientConnection);

#[async_trait]
impl PacketReceiver for SessionReceiver<'_> {
    async fn on_disconnect(&self, packet: Disconnect) -> Result<()> {
        let session = self.0;
        info!(client = session.inner.id, reason = %packet.reason, "Client disconnected");
        *session
            .inner
            .disconnect_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(packet.reason);
        session.close().await;
        Ok(())
    }

    async fn on_ping(&self, packet: Ping) -> Result<()> {
        let session = self.0;
        session.send_packet(Packet::Ping(packet)).await?;
        session.inner.server.metrics.ping();

        for listener in session.inner.server.listeners.snapshot() {
            listener.client_pinged(session, packet.id).await?;
        }
        Ok(())
    }

    async fn on_command(&self, packet: Command) -> Result<()> {
        for listener in self.0.inner.server.listeners.snapshot() {
            listener
                .command_received(self.0, &packet.name, &packet.args)
                .await?;
        }
        Ok(())
    }

    async fn on_command_response(&self, packet: CommandResponse) -> Result<()> {
        for listener in self.0.inner.server.listeners.snapshot() {
            listener.response_received(self.0, &packet.data).await?;
        }
        Ok(())
    }

    async fn on_custom(&self, packet: CustomPacket) -> Result<()> {
        for listener in self.0.inner.server.listeners.snapshot() {
            listener.custom_packet_received(self.0, &packet).await?;
        }
        Ok(())
    }
}
