//! End-to-end client/server sessions over loopback TCP

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use command_protocol::error::constants;
use command_protocol::{
    ClientConnection, ClientListener, CommandClient, CommandServer, FixedTokenProvider, Packet,
    PacketRegistry, ProtocolError, Result, ServerListener, SessionState,
};
use common::{spawn_client, spawn_server, wait_until, ChatMessage, Event, Recorder, TOKEN};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Answers every command with `name:arg1,arg2`
struct Echo;

#[async_trait]
impl ServerListener for Echo {
    async fn command_received(
        &self,
        connection: &ClientConnection,
        command: &str,
        args: &[String],
    ) -> Result<()> {
        connection
            .respond(format!("{command}:{}", args.join(",")).into_bytes())
            .await
    }
}

/// Keeps a handle on every authorized session
#[derive(Default)]
struct Sessions(Mutex<Vec<ClientConnection>>);

impl Sessions {
    fn first(&self) -> ClientConnection {
        self.0.lock().unwrap()[0].clone()
    }
}

#[async_trait]
impl ServerListener for Sessions {
    async fn client_authorized(&self, connection: &ClientConnection) -> Result<()> {
        self.0.lock().unwrap().push(connection.clone());
        Ok(())
    }
}

/// Leaves as soon as the server accepts the token
struct LeaveOnAuthorized;

#[async_trait]
impl ClientListener for LeaveOnAuthorized {
    async fn authorized(&self, client: &CommandClient) -> Result<()> {
        client.disconnect("done").await
    }
}

async fn authenticate(port: u16, token: &str) -> Result<()> {
    let client = CommandClient::new("127.0.0.1", port, token);
    client.add_listener(Arc::new(LeaveOnAuthorized));
    client.connect().await
}

fn is_authorized(event: &Event) -> bool {
    matches!(event, Event::Authorized)
}

fn is_connected(event: &Event) -> bool {
    matches!(event, Event::Connected)
}

fn is_disconnected(event: &Event) -> bool {
    matches!(event, Event::Disconnected(_))
}

#[tokio::test]
async fn authorized_session_round_trip() {
    let server = CommandServer::new("127.0.0.1", 0, TOKEN);
    let server_events = Recorder::new();
    let sessions = Arc::new(Sessions::default());
    server.add_listener(server_events.clone());
    server.add_listener(Arc::new(Echo));
    server.add_listener(sessions.clone());
    let (addr, server_task) = spawn_server(&server).await;

    let client = CommandClient::new("127.0.0.1", addr.port(), TOKEN);
    let client_events = Recorder::new();
    client.add_listener(client_events.clone());
    let client_task = spawn_client(&client);

    // The first keep-alive goes out right after authorization
    wait_until(|| {
        client_events.count(|e| matches!(e, Event::PingReceived(_))) == 1
            && client_events.count(|e| matches!(e, Event::Pinged(_))) == 1
    })
    .await;
    assert_eq!(client.state(), SessionState::Active);
    assert!(client.pending_ping().is_none());

    let pinged: Vec<_> = client_events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Pinged(id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(pinged.len(), 1);
    assert!(client_events
        .events()
        .contains(&Event::PingReceived(pinged[0])));
    wait_until(|| server_events.events().contains(&Event::Pinged(pinged[0]))).await;

    // Client to server, answered by the echo listener
    client.send_command("say", ["hello", "wörld"]).await.unwrap();
    wait_until(|| {
        client_events
            .events()
            .contains(&Event::Response("say:hello,wörld".as_bytes().to_vec()))
    })
    .await;
    assert!(server_events.events().contains(&Event::Command(
        "say".into(),
        vec!["hello".into(), "wörld".into()]
    )));

    // Server to client, answered by the client
    let session = sessions.first();
    assert!(session.is_authenticated());
    assert_eq!(session.peer_addr().map(|a| a.ip()), Some(addr.ip()));
    session
        .send_command("status", Vec::<String>::new())
        .await
        .unwrap();
    wait_until(|| {
        client_events
            .events()
            .contains(&Event::Command("status".into(), vec![]))
    })
    .await;
    client.respond(Vec::new()).await.unwrap();
    wait_until(|| server_events.events().contains(&Event::Response(vec![]))).await;

    client.disconnect("bye").await.unwrap();
    client_task.await.unwrap().unwrap();
    assert!(client.is_closed());
    assert_eq!(client.state(), SessionState::Closed);

    wait_until(|| server_events.count(is_disconnected) == 1).await;
    assert!(server_events
        .events()
        .contains(&Event::Disconnected(Some("bye".into()))));
    assert_eq!(server_events.count(is_connected), 1);
    assert_eq!(server_events.count(is_authorized), 1);
    assert_eq!(client_events.count(is_authorized), 1);
    assert_eq!(session.disconnect_reason().as_deref(), Some("bye"));

    server.close().await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let server = CommandServer::new("127.0.0.1", 0, TOKEN);
    let server_events = Recorder::new();
    server.add_listener(server_events.clone());
    let (addr, _server_task) = spawn_server(&server).await;

    let client = CommandClient::new("127.0.0.1", addr.port(), "WRONG");
    let client_events = Recorder::new();
    client.add_listener(client_events.clone());

    let error = client.connect().await.unwrap_err();
    match &error {
        ProtocolError::AuthRejected(reason) => assert_eq!(reason, "Received invalid token"),
        other => panic!("Expected AuthRejected, got {other:?}"),
    }
    assert_eq!(
        error.to_string(),
        "Server rejected the connection: Received invalid token"
    );
    assert!(client.is_closed());
    assert!(client_events.events().is_empty());

    wait_until(|| server_events.count(is_disconnected) == 1).await;
    assert_eq!(server_events.count(is_connected), 1);
    assert_eq!(server_events.count(is_authorized), 0);
    assert_eq!(server.metrics().snapshot().auth_failed, 1);

    server.close().await;
}

#[tokio::test]
async fn token_provider_is_consulted_per_handshake() {
    let current = Arc::new(Mutex::new(String::from("one")));
    let server = CommandServer::builder("127.0.0.1", 0, "unused")
        .token_provider({
            let current = current.clone();
            move || current.lock().unwrap().clone()
        })
        .build()
        .unwrap();
    let (addr, _server_task) = spawn_server(&server).await;

    authenticate(addr.port(), "one").await.unwrap();

    *current.lock().unwrap() = "two".into();
    assert!(matches!(
        authenticate(addr.port(), "one").await,
        Err(ProtocolError::AuthRejected(_))
    ));
    authenticate(addr.port(), "two").await.unwrap();

    server.set_token_provider(FixedTokenProvider::new("three"));
    authenticate(addr.port(), "three").await.unwrap();
    assert!(authenticate(addr.port(), "two").await.is_err());

    server.close().await;
}

#[tokio::test]
async fn empty_token_is_accepted() {
    let server = CommandServer::new("127.0.0.1", 0, "");
    let (addr, _server_task) = spawn_server(&server).await;

    authenticate(addr.port(), "").await.unwrap();
    assert!(authenticate(addr.port(), " ").await.is_err());

    server.close().await;
}

#[tokio::test]
async fn pool_of_one_queues_the_second_client() {
    let server = CommandServer::new("127.0.0.1", 0, TOKEN);
    let server_events = Recorder::new();
    server.add_listener(server_events.clone());
    let (addr, _server_task) = spawn_server(&server).await;

    let first = CommandClient::new("127.0.0.1", addr.port(), TOKEN);
    let first_task = spawn_client(&first);
    wait_until(|| first.state() == SessionState::Active).await;

    let second = CommandClient::new("127.0.0.1", addr.port(), TOKEN);
    let second_task = spawn_client(&second);
    wait_until(|| server_events.count(is_connected) == 2).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(second.state(), SessionState::Authenticating);
    assert_eq!(server_events.count(is_authorized), 1);
    assert_eq!(server.metrics().snapshot().sessions_waiting, 1);

    first.disconnect("done").await.unwrap();
    first_task.await.unwrap().unwrap();

    wait_until(|| second.state() == SessionState::Active).await;
    assert_eq!(server_events.count(is_authorized), 2);
    assert_eq!(server.metrics().snapshot().sessions_waiting, 0);

    second.close().await;
    second_task.await.unwrap().unwrap();
    server.close().await;
}

#[tokio::test]
async fn larger_pool_serves_clients_concurrently() {
    let server = CommandServer::new("127.0.0.1", 0, TOKEN);
    server.set_pool_size(3).unwrap();
    let (addr, _server_task) = spawn_server(&server).await;

    let clients: Vec<_> = (0..3)
        .map(|_| CommandClient::new("127.0.0.1", addr.port(), TOKEN))
        .collect();
    let tasks: Vec<_> = clients.iter().map(spawn_client).collect();

    wait_until(|| clients.iter().all(|c| c.state() == SessionState::Active)).await;

    for client in &clients {
        client.close().await;
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    server.close().await;
}

#[tokio::test]
async fn custom_packets_flow_both_ways() {
    let registry = Arc::new(PacketRegistry::new());
    let id = registry.register_next::<ChatMessage>().unwrap();
    registry.lock_registering();

    let server = CommandServer::builder("127.0.0.1", 0, TOKEN)
        .registry(registry.clone())
        .build()
        .unwrap();
    let server_events = Recorder::new();
    let sessions = Arc::new(Sessions::default());
    server.add_listener(server_events.clone());
    server.add_listener(sessions.clone());
    let (addr, _server_task) = spawn_server(&server).await;

    let client = CommandClient::builder("127.0.0.1", addr.port(), TOKEN)
        .registry(registry.clone())
        .build();
    let client_events = Recorder::new();
    client.add_listener(client_events.clone());
    let client_task = spawn_client(&client);
    wait_until(|| client.state() == SessionState::Active).await;

    let message = ChatMessage {
        user: "bob".into(),
        text: "hi".into(),
    };
    client
        .send_packet(Packet::custom(&registry, message.clone()).unwrap())
        .await
        .unwrap();
    wait_until(|| server_events.events().contains(&Event::Custom(id))).await;

    sessions
        .first()
        .send_packet(Packet::custom(&registry, message).unwrap())
        .await
        .unwrap();
    wait_until(|| client_events.events().contains(&Event::Custom(id))).await;

    client.close().await;
    client_task.await.unwrap().unwrap();
    server.close().await;
}

#[tokio::test]
async fn server_close_ends_open_sessions() {
    let server = CommandServer::new("127.0.0.1", 0, TOKEN);
    let server_events = Recorder::new();
    server.add_listener(server_events.clone());
    let (addr, server_task) = spawn_server(&server).await;

    let client = CommandClient::new("127.0.0.1", addr.port(), TOKEN);
    let client_task = spawn_client(&client);
    wait_until(|| client.state() == SessionState::Active).await;

    server.close().await;
    server_task.await.unwrap().unwrap();
    client_task.await.unwrap().unwrap();

    wait_until(|| server_events.count(is_disconnected) == 1).await;
    assert!(client.is_closed());
    assert!(server.is_closed());
}

#[tokio::test]
async fn silent_peer_hits_the_handshake_deadline() {
    let server = CommandServer::builder("127.0.0.1", 0, TOKEN)
        .handshake_timeout(Some(Duration::from_millis(100)))
        .build()
        .unwrap();
    let server_events = Recorder::new();
    server.add_listener(server_events.clone());
    let (addr, _server_task) = spawn_server(&server).await;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
        .await
        .expect("server should hang up")
        .unwrap();
    assert_eq!(read, 0);

    wait_until(|| server_events.count(is_disconnected) == 1).await;
    assert_eq!(server_events.count(is_authorized), 0);
    assert_eq!(server.metrics().snapshot().auth_failed, 1);

    server.close().await;
}

#[tokio::test]
async fn connect_is_single_use() {
    let server = CommandServer::new("127.0.0.1", 0, TOKEN);
    let (addr, _server_task) = spawn_server(&server).await;

    let client = CommandClient::new("127.0.0.1", addr.port(), TOKEN);
    let client_task = spawn_client(&client);
    wait_until(|| client.state() == SessionState::Active).await;

    assert!(matches!(
        client.connect().await,
        Err(ProtocolError::InvalidState(constants::ERR_ALREADY_CONNECTED))
    ));
    assert!(client.is_connected());

    client.close().await;
    client_task.await.unwrap().unwrap();
    assert!(client.is_connected());
    server.close().await;
}

#[tokio::test]
async fn unreachable_server_fails_connect() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = CommandClient::new("127.0.0.1", port, TOKEN);
    assert!(matches!(client.connect().await, Err(ProtocolError::Io(_))));
    assert_eq!(client.state(), SessionState::Closed);
    assert!(client.is_closed());
}
