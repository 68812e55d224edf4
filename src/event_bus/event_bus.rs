// SPDX-License-Identifier: GPL-2.0-or-later

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use common::{ArcEventSink, ArcMsgLogger, ClientId, DynError, Event, EventSink, LogLevel, MsgLogger};
use futures_util::{stream::StreamExt, SinkExt};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

/// A connection with no inbound traffic for this long is dropped.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Serialized write half of one client connection.
#[async_trait]
pub trait ConnectionWriter: Send {
    async fn send_text(&mut self, text: String) -> Result<(), DynError>;
}

#[async_trait]
impl ConnectionWriter for futures_util::stream::SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<(), DynError> {
        Ok(self.send(Message::Text(text.into())).await?)
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn ConnectionWriter>>>;

/// Ordered JSON event delivery to named client connections. No queuing, no
/// retry: when the client is gone the event is dropped and the mapping
/// removed.
pub struct EventBus {
    logger: ArcMsgLogger,
    connections: Mutex<HashMap<ClientId, SharedWriter>>,
}

impl EventBus {
    #[must_use]
    pub fn new(logger: ArcMsgLogger) -> Arc<Self> {
        Arc::new(Self {
            logger,
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Registers (or replaces) the write half for a client.
    pub fn register(&self, client_id: ClientId, writer: Box<dyn ConnectionWriter>) {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(client_id, Arc::new(tokio::sync::Mutex::new(writer)));
    }

    pub fn disconnect(&self, client_id: &ClientId) {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(client_id);
    }

    #[must_use]
    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(client_id)
    }

    /// Sends one event. Serialization and the write happen outside the
    /// registry lock; sends to the same client serialize on the
    /// per-connection lock. Any write error silently disconnects.
    pub async fn send(&self, client_id: &ClientId, event: &Event) {
        let writer = {
            self.connections
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(client_id)
                .cloned()
        };
        let Some(writer) = writer else {
            return;
        };
        let Ok(text) = serde_json::to_string(event) else {
            return;
        };
        let failed = writer.lock().await.send_text(text).await.is_err();
        if failed {
            self.logger.log(
                LogLevel::Debug,
                &format!("client '{client_id}' went away, dropping connection"),
            );
            self.disconnect(client_id);
        }
    }

    /// Drives one WebSocket connection to completion: registers the write
    /// half, then runs the receive loop with the 60 s idle timeout.
    /// `{"type":"ping"}` is answered with `{"type":"pong"}`; anything else
    /// inbound is ignored.
    pub async fn run_connection(self: &Arc<Self>, client_id: ClientId, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        self.register(client_id.clone(), Box::new(sink));
        self.logger
            .log(LogLevel::Debug, &format!("client '{client_id}' connected"));

        loop {
            match tokio::time::timeout(RECEIVE_TIMEOUT, stream.next()).await {
                // Idle timeout or closed stream.
                Err(_) | Ok(None | Some(Err(_))) => break,
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Some(reply) = inbound_reply(&text) {
                        let writer = {
                            self.connections
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .get(&client_id)
                                .cloned()
                        };
                        let Some(writer) = writer else {
                            break;
                        };
                        if writer.lock().await.send_text(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(_))) => {}
            }
        }

        self.disconnect(&client_id);
        self.logger
            .log(LogLevel::Debug, &format!("client '{client_id}' disconnected"));
    }
}

/// Reply for an inbound text frame. Pings get pongs, everything else
/// (malformed included) is ignored.
fn inbound_reply(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(serde_json::Value::as_str) == Some("ping") {
        return Some(r#"{"type":"pong"}"#.to_owned());
    }
    None
}

/// `EventSink` bound to one client of the bus. Workers publish through
/// this without ever seeing the connection registry.
pub struct ClientSink {
    bus: Arc<EventBus>,
    client_id: ClientId,
}

impl ClientSink {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, client_id: ClientId) -> ArcEventSink {
        Arc::new(Self { bus, client_id })
    }
}

#[async_trait]
impl EventSink for ClientSink {
    async fn send(&self, event: Event) {
        self.bus.send(&self.client_id, &event).await;
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use common::DummyLogger;
    use pretty_assertions::assert_eq;

    struct RecordingWriter {
        sent: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionWriter for RecordingWriter {
        async fn send_text(&mut self, text: String) -> Result<(), DynError> {
            if self.fail {
                return Err("gone".into());
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }
    }

    fn client(s: &str) -> ClientId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn send_delivers_json() {
        let bus = EventBus::new(DummyLogger::new());
        let sent = Arc::new(Mutex::new(Vec::new()));
        bus.register(
            client("c1"),
            Box::new(RecordingWriter {
                sent: sent.clone(),
                fail: false,
            }),
        );

        bus.send(&client("c1"), &Event::finished()).await;
        assert_eq!(
            vec![r#"{"type":"finish","success":true}"#.to_owned()],
            sent.lock().unwrap().clone()
        );
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_dropped() {
        let bus = EventBus::new(DummyLogger::new());
        bus.send(&client("nobody"), &Event::finished()).await;
    }

    #[tokio::test]
    async fn write_error_disconnects() {
        let bus = EventBus::new(DummyLogger::new());
        bus.register(
            client("c1"),
            Box::new(RecordingWriter {
                sent: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            }),
        );
        assert!(bus.is_connected(&client("c1")));

        bus.send(&client("c1"), &Event::finished()).await;
        assert!(!bus.is_connected(&client("c1")));
    }

    #[tokio::test]
    async fn reconnect_replaces_writer() {
        let bus = EventBus::new(DummyLogger::new());
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        bus.register(
            client("c1"),
            Box::new(RecordingWriter {
                sent: first.clone(),
                fail: false,
            }),
        );
        bus.register(
            client("c1"),
            Box::new(RecordingWriter {
                sent: second.clone(),
                fail: false,
            }),
        );

        bus.send(&client("c1"), &Event::finished()).await;
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(1, second.lock().unwrap().len());
    }

    #[tokio::test]
    async fn client_sink_forwards() {
        let bus = EventBus::new(DummyLogger::new());
        let sent = Arc::new(Mutex::new(Vec::new()));
        bus.register(
            client("c1"),
            Box::new(RecordingWriter {
                sent: sent.clone(),
                fail: false,
            }),
        );

        let sink = ClientSink::new(bus, client("c1"));
        sink.send(Event::Log {
            message: "hi".to_owned(),
        })
        .await;
        assert_eq!(
            vec![r#"{"type":"log","message":"hi"}"#.to_owned()],
            sent.lock().unwrap().clone()
        );
    }

    #[test]
    fn ping_gets_pong() {
        assert_eq!(
            Some(r#"{"type":"pong"}"#.to_owned()),
            inbound_reply(r#"{"type":"ping"}"#)
        );
        assert_eq!(None, inbound_reply(r#"{"type":"other"}"#));
        assert_eq!(None, inbound_reply("not json at all"));
    }
}
