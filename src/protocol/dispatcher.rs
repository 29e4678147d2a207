use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::core::packet::{
    Auth, AuthSuccess, Command, CommandResponse, CustomPacket, Disconnect, Packet, Ping,
};
use crate::error::Result;
use crate::utils::metrics::Metrics;

/// Per-kind packet handling for one side of a session.
///
/// Every built-in kind has a no-op default, so a receiver only overrides what
/// it reacts to. An error returned from any handler ends the session.
#[async_trait]
pub trait PacketReceiver: Send + Sync {
    async fn on_disconnect(&self, _packet: Disconnect) -> Result<()> {
        Ok(())
    }

    async fn on_auth(&self, _packet: Auth) -> Result<()> {
        Ok(())
    }

    async fn on_auth_success(&self, _packet: AuthSuccess) -> Result<()> {
        Ok(())
    }

    async fn on_ping(&self, _packet: Ping) -> Result<()> {
        Ok(())
    }

    async fn on_command(&self, _packet: Command) -> Result<()> {
        Ok(())
    }

    async fn on_command_response(&self, _packet: CommandResponse) -> Result<()> {
        Ok(())
    }

    /// Packets of user-registered kinds
    async fn on_custom(&self, packet: CustomPacket) -> Result<()>;
}

/// Routes decoded packets to a [`PacketReceiver`] by kind.
/// Exactly one handler runs per packet, on the session's read task.
pub struct Dispatcher<R> {
    receiver: R,
    metrics: Option<Arc<Metrics>>,
}

impl<R: PacketReceiver> Dispatcher<R> {
    pub fn new(receiver: R) -> Self {
        Self {
            receiver,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    pub async fn dispatch(&self, packet: Packet) -> Result<()> {
        trace!(packet = packet.name(), id = packet.id(), "Dispatching packet");
        if let Some(metrics) = &self.metrics {
            metrics.packet_received();
        }

        match packet {
            Packet::Disconnect(packet) => self.receiver.on_disconnect(packet).await,
            Packet::Auth(packet) => self.receiver.on_auth(packet).await,
            Packet::AuthSuccess(packet) => self.receiver.on_auth_success(packet).await,
            Packet::Ping(packet) => self.receiver.on_ping(packet).await,
            Packet::Command(packet) => self.receiver.on_command(packet).await,
            Packet::CommandResponse(packet) => self.receiver.on_command_response(packet).await,
            Packet::Custom(packet) => self.receiver.on_custom(packet).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl PacketReceiver for Recorder {
        async fn on_ping(&self, packet: Ping) -> Result<()> {
            assert_eq!(packet.id, 42);
            self.seen.lock().unwrap().push("ping");
            Ok(())
        }

        async fn on_command(&self, packet: Command) -> Result<()> {
            assert_eq!(packet.name, "list");
            self.seen.lock().unwrap().push("command");
            Ok(())
        }

        async fn on_custom(&self, _packet: CustomPacket) -> Result<()> {
            self.seen.lock().unwrap().push("custom");
            Ok(())
        }
    }

    #[tokio::test]
    async fn routes_by_kind_and_ignores_unhandled() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Recorder::default()).with_metrics(metrics.clone());

        dispatcher.dispatch(Packet::ping(42)).await.unwrap();
        dispatcher
            .dispatch(Packet::command("list", Vec::<String>::new()))
            .await
            .unwrap();
        dispatcher.dispatch(Packet::auth_success()).await.unwrap();

        assert_eq!(
            *dispatcher.receiver().seen.lock().unwrap(),
            vec!["ping", "command"]
        );
        assert_eq!(metrics.snapshot().packets_received, 3);
    }
}
