//! Command client.
//!
//! A [`CommandClient`] opens one connection to a [`CommandServer`], authenticates
//! with its token, then keeps the session alive with periodic pings while
//! dispatching whatever the server sends to registered [`ClientListener`]s.
//!
//! [`CommandServer`]: crate::service::server::CommandServer

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ClientConfig, NetworkConfig, MAX_PAYLOAD_SIZE};
use crate::core::codec::PacketCodec;
use crate::core::packet::{Command, CommandResponse, CustomPacket, Disconnect, Packet, Ping};
use crate::core::registry::PacketRegistry;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, PacketReceiver};
use crate::protocol::handshake::client_handshake;
use crate::protocol::listener::ListenerList;
use crate::protocol::state::{SessionState, StateCell};
use crate::transport::connection::Connection;
use crate::transport::tls::{self, TlsClientConfig};
use crate::utils::metrics::Metrics;
use crate::utils::time::current_millis;
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT, KEEPALIVE_INTERVAL};

/// `pending_ping` value while no keep-alive is outstanding
const NO_PENDING_PING: i64 = -1;

/// Client-side session events. Every method defaults to doing nothing.
///
/// Callbacks run on the session's read task (keep-alive events on the
/// keep-alive task). Returning an error ends the session.
#[async_trait]
pub trait ClientListener: Send + Sync {
    /// The server accepted our token
    async fn authorized(&self, _client: &CommandClient) -> Result<()> {
        Ok(())
    }

    async fn command_received(
        &self,
        _client: &CommandClient,
        _command: &str,
        _args: &[String],
    ) -> Result<()> {
        Ok(())
    }

    /// The server sent a Disconnect; the connection closes right after
    async fn disconnected(&self, _client: &CommandClient, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn response_received(&self, _client: &CommandClient, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// A keep-alive ping with `id` was sent to the server
    async fn server_pinged(&self, _client: &CommandClient, _id: i64) -> Result<()> {
        Ok(())
    }

    /// The server echoed the outstanding keep-alive
    async fn server_ping_received(&self, _client: &CommandClient, _id: i64) -> Result<()> {
        Ok(())
    }

    async fn custom_packet_received(
        &self,
        _client: &CommandClient,
        _packet: &CustomPacket,
    ) -> Result<()> {
        Ok(())
    }
}

/// Connects to a command server. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct CommandClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    host: String,
    port: u16,
    token: String,
    tls: Option<TlsClientConfig>,
    registry: Arc<PacketRegistry>,
    connection_timeout: Duration,
    keepalive_interval: Duration,
    max_payload_size: usize,
    listeners: ListenerList<dyn ClientListener>,
    connection: OnceLock<Arc<Connection>>,
    connected: AtomicBool,
    pending_ping: AtomicI64,
    /// Why the client ended the session itself, returned by `connect`
    failure: Mutex<Option<ProtocolError>>,
    state: StateCell,
    keepalive: CancellationToken,
    metrics: Arc<Metrics>,
}

/// Builder for [`CommandClient`]
pub struct ClientBuilder {
    host: String,
    port: u16,
    token: String,
    tls: Option<TlsClientConfig>,
    registry: Option<Arc<PacketRegistry>>,
    connection_timeout: Duration,
    keepalive_interval: Duration,
    max_payload_size: usize,
}

impl ClientBuilder {
    /// Use TLS, trusting what `config` trusts
    pub fn tls(mut self, config: TlsClientConfig) -> Self {
        self.tls = Some(config);
        self
    }

    /// Share a packet registry, typically the server's, so custom kinds match
    pub fn registry(mut self, registry: Arc<PacketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Apply timeouts from a [`ClientConfig`]. The address is not used.
    pub fn config(mut self, config: &ClientConfig) -> Self {
        self.connection_timeout = config.connection_timeout;
        self.keepalive_interval = config.keepalive_interval;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn build(self) -> CommandClient {
        CommandClient {
            inner: Arc::new(ClientInner {
                host: self.host,
                port: self.port,
                token: self.token,
                tls: self.tls,
                registry: self
                    .registry
                    .unwrap_or_else(|| Arc::new(PacketRegistry::new())),
                connection_timeout: self.connection_timeout,
                keepalive_interval: self.keepalive_interval,
                max_payload_size: self.max_payload_size,
                listeners: ListenerList::new(),
                connection: OnceLock::new(),
                connected: AtomicBool::new(false),
                pending_ping: AtomicI64::new(NO_PENDING_PING),
                failure: Mutex::new(None),
                state: StateCell::new(SessionState::Connecting),
                keepalive: CancellationToken::new(),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }
}

impl CommandClient {
    /// Client with default settings and its own registry
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self::builder(host, port, token).build()
    }

    pub fn builder(host: impl Into<String>, port: u16, token: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            host: host.into(),
            port,
            token: token.into(),
            tls: None,
            registry: None,
            connection_timeout: DEFAULT_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    /// Builder populated from a full [`NetworkConfig`]: address, timeouts,
    /// payload limit and, if enabled, TLS trusting `transport.cert_path`
    pub fn from_config(config: &NetworkConfig, token: impl Into<String>) -> Result<ClientBuilder> {
        let (host, port) = split_address(&config.client.address)?;
        let mut builder = Self::builder(host, port, token)
            .config(&config.client)
            .max_payload_size(config.transport.max_payload_size);

        if config.transport.tls_enabled {
            let cert_path = config.transport.cert_path.as_ref().ok_or_else(|| {
                ProtocolError::ConfigError("TLS enabled but no certificate path set".into())
            })?;
            builder = builder.tls(
                TlsClientConfig::new(config.transport.server_name.clone())
                    .with_trusted_cert_file(cert_path)?,
            );
        }
        Ok(builder)
    }

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// True once [`connect`](Self::connect) has been called, even after the
    /// session ended
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.connection.get() {
            Some(connection) => connection.is_closed(),
            None => self.inner.state.get() == SessionState::Closed,
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Id of the keep-alive ping awaiting its echo, if any
    pub fn pending_ping(&self) -> Option<i64> {
        match self.inner.pending_ping.load(Ordering::SeqCst) {
            NO_PENDING_PING => None,
            id => Some(id),
        }
    }

    /// Connect, authenticate, and run the session until it ends.
    ///
    /// Resolves when the connection closes: `Ok(())` for an orderly close
    /// (either side disconnected, or [`close`](Self::close) was called),
    /// otherwise the error that ended the session. A rejected token yields
    /// [`ProtocolError::AuthRejected`] with the server's reason, an unanswered
    /// keep-alive [`ProtocolError::Timeout`] and a foreign keep-alive echo
    /// [`ProtocolError::ProtocolViolation`]. May be called once per client.
    #[instrument(skip(self), fields(host = %self.inner.host, port = self.inner.port))]
    pub async fn connect(&self) -> Result<()> {
        if self.inner.state.get() == SessionState::Closed {
            return Err(ProtocolError::InvalidState(constants::ERR_CLIENT_CLOSED));
        }
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::InvalidState(constants::ERR_ALREADY_CONNECTED));
        }

        let connection = match self.open().await {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                warn!(error = %e, "Failed to connect");
                self.inner.state.set(SessionState::Closed);
                return Err(e);
            }
        };
        // `connected` guards this; set can only fail if a second connect raced past it
        let _ = self.inner.connection.set(connection.clone());

        let result = self.run(&connection).await.and_then(|()| match self.take_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        });
        self.close().await;

        match &result {
            Ok(()) => info!("Session closed"),
            Err(e) => debug!(error = %e, "Session ended with error"),
        }
        result
    }

    /// Send a command to the server
    pub async fn send_command<I, S>(&self, name: impl Into<String>, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send_packet(Packet::command(name, args)).await
    }

    /// Answer a command received from the server
    pub async fn respond(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_packet(Packet::response(data)).await
    }

    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.connection()?.send(packet).await
    }

    /// Tell the server why we leave, then close. Delivery of the reason is
    /// best effort; the connection closes either way.
    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<()> {
        let connection = self.connection()?;
        let reason = reason.into();
        self.inner.state.set(SessionState::Disconnecting);
        info!(%reason, "Disconnecting");

        connection
            .send_before_close(Packet::disconnect(reason))
            .await;
        self.close().await;
        Ok(())
    }

    /// Stop keep-alives and close the connection without a Disconnect packet
    pub async fn close(&self) {
        self.inner.keepalive.cancel();
        if let Some(connection) = self.inner.connection.get() {
            connection.close().await;
        }
        self.inner.state.set(SessionState::Closed);
    }

    fn fail(&self, error: ProtocolError) {
        let mut failure = self
            .inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        failure.get_or_insert(error);
    }

    fn take_failure(&self) -> Option<ProtocolError> {
        self.inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn connection(&self) -> Result<&Arc<Connection>> {
        self.inner
            .connection
            .get()
            .ok_or(ProtocolError::InvalidState(constants::ERR_NOT_CONNECTED))
    }

    async fn open(&self) -> Result<Connection> {
        let address = format!("{}:{}", self.inner.host, self.inner.port);
        let timeout = self.inner.connection_timeout;

        let stream = with_timeout_error(
            async {
                TcpStream::connect(&address)
                    .await
                    .map_err(ProtocolError::from)
            },
            timeout,
        )
        .await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        debug!(?peer_addr, "TCP connection established");

        let codec = PacketCodec::new(self.inner.registry.clone())
            .with_max_payload_size(self.inner.max_payload_size);
        let connection = match &self.inner.tls {
            Some(config) => {
                let stream = with_timeout_error(tls::connect(config, stream), timeout).await?;
                Connection::new(stream, codec)
            }
            None => Connection::new(stream, codec),
        };

        Ok(connection
            .with_peer_addr(peer_addr)
            .with_metrics(self.inner.metrics.clone()))
    }

    async fn run(&self, connection: &Arc<Connection>) -> Result<()> {
        self.inner.state.set(SessionState::Authenticating);
        client_handshake(connection, &self.inner.token).await?;

        self.inner.state.set(SessionState::Active);
        info!("Authorized");
        for listener in self.inner.listeners.snapshot() {
            listener.authorized(self).await?;
        }

        self.spawn_keepalive(connection.clone());

        let dispatcher =
            Dispatcher::new(ClientReceiver(self)).with_metrics(self.inner.metrics.clone());
        while let Some(packet) = connection.recv().await? {
            dispatcher.dispatch(packet).await?;
        }
        Ok(())
    }

    fn spawn_keepalive(&self, connection: Arc<Connection>) {
        let client = self.clone();
        let stop = self.inner.keepalive.clone();
        let period = self.inner.keepalive_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if !client.keepalive_tick(&connection).await {
                            break;
                        }
                    }
                }
            }
            debug!("Keep-alive stopped");
        });
    }

    /// One keep-alive round. Returns false once the session is over.
    async fn keepalive_tick(&self, connection: &Connection) -> bool {
        if self.pending_ping().is_some() {
            warn!("Server did not answer the last keep-alive");
            self.time_out().await;
            return false;
        }

        let id = current_millis();
        self.inner.pending_ping.store(id, Ordering::SeqCst);
        // A ping that can't be written within one period is as good as unanswered
        match with_timeout_error(connection.send(Packet::ping(id)), self.inner.keepalive_interval)
            .await
        {
            Ok(()) => {}
            Err(ProtocolError::Timeout) => {
                warn!("Keep-alive could not be written");
                self.time_out().await;
                return false;
            }
            Err(e) => {
                debug!(error = %e, "Failed to send keep-alive");
                self.close().await;
                return false;
            }
        }
        self.inner.metrics.ping();

        for listener in self.inner.listeners.snapshot() {
            if let Err(e) = listener.server_pinged(self, id).await {
                warn!(error = %e, "Listener failed");
                self.fail(e);
                self.close().await;
                return false;
            }
        }
        true
    }

    async fn time_out(&self) {
        self.fail(ProtocolError::Timeout);
        let _ = self.disconnect(constants::ERR_TIMED_OUT).await;
    }
}

impl fmt::Debug for CommandClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandClient")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("tls", &self.inner.tls.is_some())
            .field("state", &self.state())
            .finish()
    }
}

struct ClientReceiver<'a>(&'a CommandClient);

#[async_trait]
impl PacketReceiver for ClientReceiver<'_> {
    async fn on_disconnect(&self, packet: Disconnect) -> Result<()> {
        let client = self.0;
        info!(reason = %packet.reason, "Server disconnected");
        client.inner.state.set(SessionState::Disconnecting);

        for listener in client.inner.listeners.snapshot() {
            listener.disconnected(client, &packet.reason).await?;
        }
        client.close().await;
        Ok(())
    }

    async fn on_ping(&self, packet: Ping) -> Result<()> {
        let client = self.0;
        let expected = client.pending_ping();

        if expected != Some(packet.id) {
            warn!(?expected, received = packet.id, "Unexpected keep-alive id");
            let reason = match expected {
                Some(id) => format!(
                    "{} (expected {id}, got {})",
                    constants::ERR_INVALID_KEEPALIVE,
                    packet.id
                ),
                None => format!(
                    "{} (none outstanding, got {})",
                    constants::ERR_INVALID_KEEPALIVE,
                    packet.id
                ),
            };
            client.disconnect(reason.clone()).await?;
            return Err(ProtocolError::violation(reason));
        }

        client
            .inner
            .pending_ping
            .store(NO_PENDING_PING, Ordering::SeqCst);
        for listener in client.inner.listeners.snapshot() {
            listener.server_ping_received(client, packet.id).await?;
        }
        Ok(())
    }

    async fn on_command(&self, packet: Command) -> Result<()> {
        for listener in self.0.inner.listeners.snapshot() {
            listener
                .command_received(self.0, &packet.name, &packet.args)
                .await?;
        }
        Ok(())
    }

    async fn on_command_response(&self, packet: CommandResponse) -> Result<()> {
        for listener in self.0.inner.listeners.snapshot() {
            listener.response_received(self.0, &packet.data).await?;
        }
        Ok(())
    }

    async fn on_custom(&self, packet: CustomPacket) -> Result<()> {
        for listener in self.0.inner.listeners.snapshot() {
            listener.custom_packet_received(self.0, &packet).await?;
        }
        Ok(())
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub(crate) fn split_address(address: &str) -> Result<(String, u16)> {
    let invalid = || ProtocolError::ConfigError(format!("Invalid address: {address}"));
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_splitting() {
        assert_eq!(
            split_address("127.0.0.1:7561").unwrap(),
            ("127.0.0.1".to_string(), 7561)
        );
        assert_eq!(split_address("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(split_address("localhost").is_err());
        assert!(split_address(":80").is_err());
        assert!(split_address("host:99999").is_err());
    }

    #[tokio::test]
    async fn operations_before_connect_fail() {
        let client = CommandClient::new("127.0.0.1", 1, "TOKEN");
        assert!(!client.is_connected());
        assert!(client.pending_ping().is_none());
        assert!(matches!(
            client.send_command("list", Vec::<String>::new()).await,
            Err(ProtocolError::InvalidState(constants::ERR_NOT_CONNECTED))
        ));
        assert!(matches!(
            client.disconnect("bye").await,
            Err(ProtocolError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn closed_client_cannot_connect() {
        let client = CommandClient::new("127.0.0.1", 1, "TOKEN");
        client.close().await;
        assert!(client.is_closed());
        assert!(matches!(
            client.connect().await,
            Err(ProtocolError::InvalidState(constants::ERR_CLIENT_CLOSED))
        ));
    }
}
