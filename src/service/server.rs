//! Command server.
//!
//! Accepts TCP (optionally TLS) connections, authenticates each client against
//! the current token, then dispatches the client's packets to registered
//! [`ServerListener`]s. At most `pool_size` sessions are served at once;
//! further accepted connections wait in FIFO order for a free slot.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{NetworkConfig, ServerConfig, DEFAULT_POOL_SIZE, MAX_PAYLOAD_SIZE};
use crate::core::codec::PacketCodec;
use crate::core::packet::CustomPacket;
use crate::core::registry::PacketRegistry;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::listener::ListenerList;
use crate::protocol::token::{FixedTokenProvider, TokenProvider};
use crate::service::client::split_address;
use crate::service::session::ClientConnection;
use crate::transport::connection::Connection;
use crate::transport::tls::{self, TlsServerConfig};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_optional_timeout, HANDSHAKE_TIMEOUT};

/// Server-side session events. Every method defaults to doing nothing.
///
/// Callbacks for one client run on that client's task. Returning an error
/// ends that client's session; `client_disconnected` still fires.
#[async_trait]
pub trait ServerListener: Send + Sync {
    /// A connection was accepted; the client has not authenticated yet
    async fn client_connected(&self, _connection: &ClientConnection) -> Result<()> {
        Ok(())
    }

    async fn client_authorized(&self, _connection: &ClientConnection) -> Result<()> {
        Ok(())
    }

    /// Fires exactly once per accepted connection, whatever ended it
    async fn client_disconnected(&self, _connection: &ClientConnection) -> Result<()> {
        Ok(())
    }

    /// A keep-alive with `id` arrived and was echoed
    async fn client_pinged(&self, _connection: &ClientConnection, _id: i64) -> Result<()> {
        Ok(())
    }

    async fn command_received(
        &self,
        _connection: &ClientConnection,
        _command: &str,
        _args: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn response_received(&self, _connection: &ClientConnection, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn custom_packet_received(
        &self,
        _connection: &ClientConnection,
        _packet: &CustomPacket,
    ) -> Result<()> {
        Ok(())
    }
}

/// Accepts and serves command clients. Cheap to clone; clones share the server.
#[derive(Clone)]
pub struct CommandServer {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    address: String,
    tls: Option<TlsAcceptor>,
    registry: Arc<PacketRegistry>,
    max_payload_size: usize,
    token_provider: RwLock<Arc<dyn TokenProvider>>,
    pool_size: AtomicUsize,
    bound: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    next_client_id: AtomicU64,
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) listeners: ListenerList<dyn ServerListener>,
    pub(crate) metrics: Arc<Metrics>,
}

impl ServerInner {
    pub(crate) fn token_provider(&self) -> Arc<dyn TokenProvider> {
        self.token_provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Builder for [`CommandServer`]
pub struct ServerBuilder {
    address: String,
    token_provider: Arc<dyn TokenProvider>,
    tls: Option<TlsServerConfig>,
    registry: Option<Arc<PacketRegistry>>,
    pool_size: usize,
    handshake_timeout: Option<Duration>,
    max_payload_size: usize,
}

impl ServerBuilder {
    /// Replace the fixed token with a provider queried on every handshake
    pub fn token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Arc::new(provider);
        self
    }

    pub fn tls(mut self, config: TlsServerConfig) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<PacketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Deadline for a client to send its Auth packet; `None` waits forever
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Apply pool size and handshake deadline from a [`ServerConfig`].
    /// The address is not used.
    pub fn config(mut self, config: &ServerConfig) -> Self {
        self.pool_size = config.pool_size;
        self.handshake_timeout = config.handshake_deadline();
        self
    }

    pub fn build(self) -> Result<CommandServer> {
        if self.pool_size < 1 {
            return Err(ProtocolError::ConfigError(constants::ERR_POOL_SIZE.into()));
        }
        let tls = self.tls.as_ref().map(TlsServerConfig::acceptor).transpose()?;

        Ok(CommandServer {
            inner: Arc::new(ServerInner {
                address: self.address,
                tls,
                registry: self
                    .registry
                    .unwrap_or_else(|| Arc::new(PacketRegistry::new())),
                max_payload_size: self.max_payload_size,
                token_provider: RwLock::new(self.token_provider),
                pool_size: AtomicUsize::new(self.pool_size),
                bound: AtomicBool::new(false),
                local_addr: OnceLock::new(),
                shutdown: CancellationToken::new(),
                next_client_id: AtomicU64::new(1),
                handshake_timeout: self.handshake_timeout,
                listeners: ListenerList::new(),
                metrics: Arc::new(Metrics::new()),
            }),
        })
    }
}

impl CommandServer {
    /// Plain TCP server expecting `token`, serving one client at a time
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        CommandServer {
            inner: Arc::new(ServerInner {
                address: join_address(&host.into(), port),
                tls: None,
                registry: Arc::new(PacketRegistry::new()),
                max_payload_size: MAX_PAYLOAD_SIZE,
                token_provider: RwLock::new(Arc::new(FixedTokenProvider::new(token))),
                pool_size: AtomicUsize::new(DEFAULT_POOL_SIZE),
                bound: AtomicBool::new(false),
                local_addr: OnceLock::new(),
                shutdown: CancellationToken::new(),
                next_client_id: AtomicU64::new(1),
                handshake_timeout: Some(HANDSHAKE_TIMEOUT),
                listeners: ListenerList::new(),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    pub fn builder(host: impl Into<String>, port: u16, token: impl Into<String>) -> ServerBuilder {
        ServerBuilder {
            address: join_address(&host.into(), port),
            token_provider: Arc::new(FixedTokenProvider::new(token)),
            tls: None,
            registry: None,
            pool_size: DEFAULT_POOL_SIZE,
            handshake_timeout: Some(HANDSHAKE_TIMEOUT),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    /// Builder populated from a full [`NetworkConfig`]: address, pool size,
    /// handshake deadline, payload limit and, if enabled, TLS from
    /// `transport.cert_path`/`transport.key_path`
    pub fn from_config(config: &NetworkConfig, token: impl Into<String>) -> Result<ServerBuilder> {
        let (host, port) = split_address(&config.server.address)?;
        let mut builder = Self::builder(host, port, token)
            .config(&config.server)
            .max_payload_size(config.transport.max_payload_size);

        if config.transport.tls_enabled {
            let (cert_path, key_path) = match (&config.transport.cert_path, &config.transport.key_path)
            {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    return Err(ProtocolError::ConfigError(
                        "TLS enabled but certificate or key path missing".into(),
                    ))
                }
            };
            builder = builder.tls(TlsServerConfig::from_pem_files(cert_path, key_path)?);
        }
        Ok(builder)
    }

    pub(crate) fn from_inner(inner: Arc<ServerInner>) -> Self {
        Self { inner }
    }

    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Swap the token source. Takes effect for the next handshake.
    pub fn set_token_provider(&self, provider: impl TokenProvider + 'static) {
        *self
            .inner
            .token_provider
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(provider);
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size.load(Ordering::SeqCst)
    }

    /// Change how many clients are served concurrently. Only allowed before
    /// [`start`](Self::start).
    pub fn set_pool_size(&self, pool_size: usize) -> Result<()> {
        if self.is_bound() {
            return Err(ProtocolError::ConfigError(
                constants::ERR_ALREADY_BOUND.into(),
            ));
        }
        if pool_size < 1 {
            return Err(ProtocolError::ConfigError(constants::ERR_POOL_SIZE.into()));
        }
        self.inner.pool_size.store(pool_size, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Address actually bound, once [`start`](Self::start) has bound it
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Bind and accept clients until [`close`](Self::close) is called.
    ///
    /// Fails with "Already bound" when called a second time.
    #[instrument(skip(self), fields(address = %self.inner.address))]
    pub async fn start(&self) -> Result<()> {
        if self.inner.bound.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::ConfigError(
                constants::ERR_ALREADY_BOUND.into(),
            ));
        }

        let listener = match TcpListener::bind(&self.inner.address).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.bound.store(false, Ordering::SeqCst);
                error!(error = %e, "Failed to bind");
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        let _ = self.inner.local_addr.set(local_addr);

        let pool_size = self.pool_size();
        let workers = Arc::new(Semaphore::new(pool_size));
        info!(%local_addr, pool_size, tls = self.inner.tls.is_some(), "Server listening");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    info!("Server stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let workers = workers.clone();
                        tokio::spawn(async move {
                            server.serve(stream, peer, workers).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        self.inner.metrics.connection_error();
                    }
                }
            }
        }
    }

    /// Stop accepting and close every open session
    pub async fn close(&self) {
        info!("Closing server");
        self.inner.shutdown.cancel();
        self.inner.metrics.log_summary();
    }

    #[instrument(skip_all, fields(peer = %peer))]
    async fn serve(&self, stream: TcpStream, peer: SocketAddr, workers: Arc<Semaphore>) {
        let inner = &self.inner;
        let id = inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let codec =
            PacketCodec::new(inner.registry.clone()).with_max_payload_size(inner.max_payload_size);
        let connection = match &inner.tls {
            Some(acceptor) => {
                match with_optional_timeout(tls::accept(acceptor, stream), inner.handshake_timeout)
                    .await
                {
                    Ok(stream) => Connection::new(stream, codec),
                    Err(e) => {
                        warn!(error = %e, "TLS handshake failed");
                        inner.metrics.connection_error();
                        return;
                    }
                }
            }
            None => Connection::new(stream, codec),
        };
        let connection = connection
            .with_peer_addr(Some(peer))
            .with_shutdown(inner.shutdown.child_token())
            .with_metrics(inner.metrics.clone());

        let client = ClientConnection::new(id, Arc::new(connection), inner.clone());
        inner.metrics.connection_opened();
        debug!(client = id, "Client connected");

        let result = self.run_session(&client, &workers).await;
        match &result {
            Ok(()) => debug!(client = id, "Session ended"),
            Err(e @ (ProtocolError::ProtocolViolation(_) | ProtocolError::AuthRejected(_))) => {
                warn!(client = id, error = %e, "Session failed");
                inner.metrics.protocol_error();
            }
            Err(e) => debug!(client = id, error = %e, "Session ended with error"),
        }

        for listener in inner.listeners.snapshot() {
            if let Err(e) = listener.client_disconnected(&client).await {
                warn!(client = id, error = %e, "Disconnect listener failed");
            }
        }
        client.close().await;
        inner.metrics.connection_closed();
    }

    async fn run_session(&self, client: &ClientConnection, workers: &Arc<Semaphore>) -> Result<()> {
        for listener in self.inner.listeners.snapshot() {
            listener.client_connected(client).await?;
        }

        let metrics = &self.inner.metrics;
        metrics.session_queued();
        let permit = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ProtocolError::ConnectionClosed),
            permit = workers.clone().acquire_owned() => permit
                .map_err(|_| ProtocolError::ConnectionClosed),
        };
        metrics.session_dequeued();
        let permit = permit?;
        let result = client.handle().await;
        drop(permit);
        result
    }
}

impl fmt::Debug for CommandServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandServer")
            .field("address", &self.inner.address)
            .field("local_addr", &self.local_addr())
            .field("tls", &self.inner.tls.is_some())
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

fn join_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
