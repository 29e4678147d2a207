//! Helpers shared by the integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use command_protocol::{
    ClientConnection, ClientListener, CommandClient, CommandServer, CustomPacket, PacketBody,
    ProtocolError, Result, ServerListener,
};
use tokio::task::JoinHandle;

pub const TOKEN: &str = "TOKEN";

/// Application packet used to exercise the registry end to end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
}

impl PacketBody for ChatMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        for field in [&self.user, &self.text] {
            let len = u16::try_from(field.len())
                .map_err(|_| ProtocolError::Encode("field too long".into()))?;
            buf.put_u16(len);
            buf.put_slice(field.as_bytes());
        }
        Ok(())
    }

    fn decode(mut payload: &[u8]) -> Result<Self> {
        let mut read = || -> Result<String> {
            if payload.remaining() < 2 {
                return Err(ProtocolError::ProtocolViolation("truncated".into()));
            }
            let len = payload.get_u16() as usize;
            if payload.remaining() < len {
                return Err(ProtocolError::ProtocolViolation("truncated".into()));
            }
            let text = String::from_utf8(payload[..len].to_vec())
                .map_err(|_| ProtocolError::ProtocolViolation("utf8".into()))?;
            payload.advance(len);
            Ok(text)
        };
        let user = read()?;
        let text = read()?;
        drop(read);
        if !payload.is_empty() {
            return Err(ProtocolError::ProtocolViolation("trailing".into()));
        }
        Ok(Self { user, text })
    }
}

/// Start `server` in the background and wait until it is bound
pub async fn spawn_server(server: &CommandServer) -> (SocketAddr, JoinHandle<Result<()>>) {
    let handle = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };
    let addr = wait_for(|| {
        let addr = server.local_addr();
        async move { addr }
    })
    .await;
    (addr, handle)
}

/// Start `client.connect()` in the background
pub fn spawn_client(client: &CommandClient) -> JoinHandle<Result<()>> {
    let client = client.clone();
    tokio::spawn(async move { client.connect().await })
}

/// Poll `probe` until it yields a value, failing the test after five seconds
pub async fn wait_for<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = probe().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s")
}

/// Wait until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    wait_for(|| {
        let done = condition();
        async move { done.then_some(()) }
    })
    .await
}

/// Every event a listener saw, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    Authorized,
    Disconnected(Option<String>),
    Pinged(i64),
    PingReceived(i64),
    Command(String, Vec<String>),
    Response(Vec<u8>),
    Custom(u8),
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ServerListener for Recorder {
    async fn client_connected(&self, _connection: &ClientConnection) -> Result<()> {
        self.push(Event::Connected);
        Ok(())
    }

    async fn client_authorized(&self, _connection: &ClientConnection) -> Result<()> {
        self.push(Event::Authorized);
        Ok(())
    }

    async fn client_disconnected(&self, connection: &ClientConnection) -> Result<()> {
        self.push(Event::Disconnected(connection.disconnect_reason()));
        Ok(())
    }

    async fn client_pinged(&self, _connection: &ClientConnection, id: i64) -> Result<()> {
        self.push(Event::Pinged(id));
        Ok(())
    }

    async fn command_received(
        &self,
        _connection: &ClientConnection,
        command: &str,
        args: &[String],
    ) -> Result<()> {
        self.push(Event::Command(command.to_string(), args.to_vec()));
        Ok(())
    }

    async fn response_received(&self, _connection: &ClientConnection, data: &[u8]) -> Result<()> {
        self.push(Event::Response(data.to_vec()));
        Ok(())
    }

    async fn custom_packet_received(
        &self,
        _connection: &ClientConnection,
        packet: &CustomPacket,
    ) -> Result<()> {
        self.push(Event::Custom(packet.id()));
        Ok(())
    }
}

#[async_trait]
impl ClientListener for Recorder {
    async fn authorized(&self, _client: &CommandClient) -> Result<()> {
        self.push(Event::Authorized);
        Ok(())
    }

    async fn command_received(
        &self,
        _client: &CommandClient,
        command: &str,
        args: &[String],
    ) -> Result<()> {
        self.push(Event::Command(command.to_string(), args.to_vec()));
        Ok(())
    }

    async fn disconnected(&self, _client: &CommandClient, reason: &str) -> Result<()> {
        self.push(Event::Disconnected(Some(reason.to_string())));
        Ok(())
    }

    async fn response_received(&self, _client: &CommandClient, data: &[u8]) -> Result<()> {
        self.push(Event::Response(data.to_vec()));
        Ok(())
    }

    async fn server_pinged(&self, _client: &CommandClient, id: i64) -> Result<()> {
        self.push(Event::Pinged(id));
        Ok(())
    }

    async fn server_ping_received(&self, _client: &CommandClient, id: i64) -> Result<()> {
        self.push(Event::PingReceived(id));
        Ok(())
    }

    async fn custom_packet_received(
        &self,
        _client: &CommandClient,
        packet: &CustomPacket,
    ) -> Result<()> {
        self.push(Event::Custom(packet.id()));
        Ok(())
    }
}
