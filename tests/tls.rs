//! Sessions over TLS with self-signed certificates

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use command_protocol::transport::tls::{TlsClientConfig, TlsServerConfig};
use command_protocol::{
    ClientConnection, CommandClient, CommandServer, ProtocolError, Result, ServerListener,
};
use common::{spawn_client, spawn_server, wait_until, Event, Recorder, TOKEN};

struct Upper;

#[async_trait]
impl ServerListener for Upper {
    async fn command_received(
        &self,
        connection: &ClientConnection,
        command: &str,
        _args: &[String],
    ) -> Result<()> {
        connection
            .respond(command.to_uppercase().into_bytes())
            .await
    }
}

fn tls_server() -> (CommandServer, String) {
    let (tls, cert_pem) = TlsServerConfig::self_signed(vec!["localhost".into()]).unwrap();
    let server = CommandServer::builder("127.0.0.1", 0, TOKEN)
        .tls(tls)
        .build()
        .unwrap();
    (server, cert_pem)
}

#[tokio::test]
async fn commands_round_trip_over_tls() {
    let (server, cert_pem) = tls_server();
    server.add_listener(Arc::new(Upper));
    let (addr, _server_task) = spawn_server(&server).await;

    let trust = TlsClientConfig::new("localhost")
        .with_trusted_pem(cert_pem.as_bytes())
        .unwrap();
    let client = CommandClient::builder("127.0.0.1", addr.port(), TOKEN)
        .tls(trust)
        .build();
    let events = Recorder::new();
    client.add_listener(events.clone());
    let task = spawn_client(&client);

    wait_until(|| events.count(|e| matches!(e, Event::Authorized)) == 1).await;
    client.send_command("status", ["all"]).await.unwrap();
    wait_until(|| events.events().contains(&Event::Response(b"STATUS".to_vec()))).await;

    client.disconnect("bye").await.unwrap();
    task.await.unwrap().unwrap();
    server.close().await;
}

#[tokio::test]
async fn untrusted_certificate_is_refused() {
    let (server, _cert_pem) = tls_server();
    let events = Recorder::new();
    server.add_listener(events.clone());
    let (addr, _server_task) = spawn_server(&server).await;

    // Trust a different self-signed certificate
    let (_, other_pem) = TlsServerConfig::self_signed(vec!["localhost".into()]).unwrap();
    let trust = TlsClientConfig::new("localhost")
        .with_trusted_pem(other_pem.as_bytes())
        .unwrap();
    let client = CommandClient::builder("127.0.0.1", addr.port(), TOKEN)
        .tls(trust)
        .build();

    assert!(matches!(
        client.connect().await,
        Err(ProtocolError::TlsError(_))
    ));
    assert!(client.is_closed());

    wait_until(|| server.metrics().snapshot().connection_errors == 1).await;
    // The session never started, so no listener saw it
    assert!(events.events().is_empty());
    server.close().await;
}

#[tokio::test]
async fn plain_client_cannot_talk_to_tls_server() {
    let (server, _cert_pem) = tls_server();
    let (addr, _server_task) = spawn_server(&server).await;

    let client = CommandClient::new("127.0.0.1", addr.port(), TOKEN);
    assert!(client.connect().await.is_err());
    server.close().await;
}
