//! The data-plane WebSocket.
//!
//! JSON frames, closed sets on both directions: unknown frame types are
//! rejected at deserialization, never silently accepted. The broadcaster
//! here is the transport half of the collaboration gateway: the OT server
//! holds it only as a `Broadcaster` capability.

use crate::core::Core;
use atelier_collab::{Broadcaster, PresenceInfo, ServerEvent, SyncResult};
use atelier_ot::{Cursor, OperationBatch};
use atelier_types::CoreError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        document_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },
    Operation {
        document_id: String,
        batch: OperationBatch,
    },
    Cursor {
        document_id: String,
        position: usize,
        #[serde(default)]
        selection_start: Option<usize>,
        #[serde(default)]
        selection_end: Option<usize>,
    },
    Sync {
        document_id: String,
        version: u64,
    },
    Heartbeat,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered {
        document_id: String,
        version: u64,
        content: String,
        hash: String,
        presence: Vec<PresenceInfo>,
    },
    Ack {
        batch_id: String,
        version: u64,
        hash: String,
    },
    Operation {
        batch: OperationBatch,
    },
    Cursor {
        document_id: String,
        user_id: String,
        position: usize,
        selection_start: Option<usize>,
        selection_end: Option<usize>,
    },
    PresenceJoin {
        document_id: String,
        user_id: String,
    },
    PresenceLeave {
        document_id: String,
        user_id: String,
    },
    Sync {
        version: u64,
        content: String,
        operations: Vec<OperationBatch>,
    },
    HeartbeatAck,
    Error {
        message: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
}

impl ServerFrame {
    pub fn from_error(err: &CoreError) -> Self {
        ServerFrame::Error {
            message: err.to_string(),
            code: err.code().to_string(),
            retry_after_secs: err.retry_after().map(|d| d.as_secs()),
        }
    }

    fn from_sync(sync: SyncResult) -> Self {
        match sync {
            SyncResult::Operations {
                version,
                operations,
                content,
                ..
            } => ServerFrame::Sync {
                version,
                content,
                operations,
            },
            SyncResult::Snapshot {
                version, content, ..
            } => ServerFrame::Sync {
                version,
                content,
                operations: Vec::new(),
            },
        }
    }
}

/// Routes server events to connected WebSocket clients.
#[derive(Default)]
pub struct WsBroadcaster {
    clients: DashMap<String, mpsc::UnboundedSender<ServerFrame>>,
}

impl WsBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: &str) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.insert(client_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn send_frame(&self, client_id: &str, frame: ServerFrame) {
        if let Some(tx) = self.clients.get(client_id) {
            let _ = tx.send(frame);
        }
    }

    pub fn connected(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait::async_trait]
impl Broadcaster for WsBroadcaster {
    async fn send_to(&self, client_id: &str, event: ServerEvent) {
        let frame = match event {
            ServerEvent::Operation { batch } => ServerFrame::Operation { batch },
            ServerEvent::Cursor {
                document_id,
                cursor,
            } => ServerFrame::Cursor {
                document_id,
                user_id: cursor.user_id,
                position: cursor.position,
                selection_start: cursor.selection_start,
                selection_end: cursor.selection_end,
            },
            ServerEvent::PresenceJoin {
                document_id,
                user_id,
            } => ServerFrame::PresenceJoin {
                document_id,
                user_id,
            },
            ServerEvent::PresenceLeave {
                document_id,
                user_id,
            } => ServerFrame::PresenceLeave {
                document_id,
                user_id,
            },
        };
        self.send_frame(client_id, frame);
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub user_id: Option<String>,
    /// Redeems a reconnection token instead of opening a fresh session.
    #[serde(default)]
    pub reconnect_token: Option<String>,
}

pub async fn ws_handler(
    State(core): State<Arc<Core>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    // Reconnection redeems its token; fresh sessions pass admission.
    if let Some(token) = params.reconnect_token.clone() {
        return ws.on_upgrade(move |socket| handle_reconnect(core, socket, token));
    }

    let user_id = params.user_id.unwrap_or_else(|| "anonymous".to_string());
    match core.gateway.connect(&user_id) {
        Ok(client_id) => {
            ws.on_upgrade(move |socket| handle_socket(core, socket, client_id, user_id))
        }
        Err(err) => {
            let status = match &err {
                CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, err.to_string()).into_response()
        }
    }
}

async fn handle_reconnect(core: Arc<Core>, socket: WebSocket, token: String) {
    match core.gateway.reconnect(&token).await {
        Ok(outcome) => {
            let client_id = outcome.client_id.clone();
            let user_id = outcome.user_id.clone();
            let syncs: Vec<ServerFrame> = outcome
                .syncs
                .into_iter()
                .map(|(_, sync)| ServerFrame::from_sync(sync))
                .collect();
            run_session(core, socket, client_id, user_id, syncs).await;
        }
        Err(err) => {
            let mut socket = socket;
            let frame = ServerFrame::from_error(&err);
            if let Ok(body) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(body)).await;
            }
            let _ = socket.close().await;
        }
    }
}

async fn handle_socket(core: Arc<Core>, socket: WebSocket, client_id: String, user_id: String) {
    run_session(core, socket, client_id, user_id, Vec::new()).await;
}

async fn run_session(
    core: Arc<Core>,
    socket: WebSocket,
    client_id: String,
    user_id: String,
    greeting: Vec<ServerFrame>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut outbound = core.broadcaster.register(&client_id);
    for frame in greeting {
        core.broadcaster.send_frame(&client_id, frame);
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let Ok(body) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(body)).await.is_err() {
                return;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(body) => {
                let frame: ClientFrame = match serde_json::from_str(&body) {
                    Ok(frame) => frame,
                    Err(err) => {
                        core.broadcaster.send_frame(
                            &client_id,
                            ServerFrame::Error {
                                message: format!("malformed frame: {err}"),
                                code: "validation".to_string(),
                                retry_after_secs: None,
                            },
                        );
                        continue;
                    }
                };
                dispatch_frame(&core, &client_id, &user_id, frame).await;
            }
            Message::Close(_) => break,
            // Ping/pong handled by axum; binary frames are not part of the
            // protocol.
            _ => {}
        }
    }

    writer.abort();
    core.broadcaster.unregister(&client_id);
    if let Some(token) = core.gateway.disconnect(&client_id, vec![]).await {
        tracing::debug!(%client_id, token = %token.token, "Reconnection token issued");
    }
}

async fn dispatch_frame(core: &Arc<Core>, client_id: &str, user_id: &str, frame: ClientFrame) {
    match frame {
        ClientFrame::Register { document_id, .. } => {
            match core.gateway.register(client_id, user_id, &document_id).await {
                Ok((result, presence)) => core.broadcaster.send_frame(
                    client_id,
                    ServerFrame::Registered {
                        document_id: result.document_id,
                        version: result.version,
                        content: result.content,
                        hash: result.hash,
                        presence,
                    },
                ),
                Err(err) => core
                    .broadcaster
                    .send_frame(client_id, ServerFrame::from_error(&err)),
            }
        }
        ClientFrame::Operation { batch, .. } => {
            // The session, not the wire, is authoritative for identity.
            let mut batch = batch;
            batch.user_id = user_id.to_string();
            match core.gateway.submit_operation(client_id, user_id, batch).await {
                Ok(ack) => {
                    core.metrics.collab.operations_total.inc();
                    core.broadcaster.send_frame(
                        client_id,
                        ServerFrame::Ack {
                            batch_id: ack.batch_id,
                            version: ack.version,
                            hash: ack.hash,
                        },
                    );
                }
                Err(err) => {
                    core.metrics.collab.operations_rejected.inc();
                    core.broadcaster
                        .send_frame(client_id, ServerFrame::from_error(&err));
                }
            }
        }
        ClientFrame::Cursor {
            document_id,
            position,
            selection_start,
            selection_end,
        } => {
            let mut cursor = Cursor::new(user_id, position);
            if let (Some(start), Some(end)) = (selection_start, selection_end) {
                cursor = cursor.with_selection(start, end);
            }
            core.gateway.cursor_update(client_id, &document_id, cursor).await;
        }
        ClientFrame::Sync {
            document_id,
            version,
        } => match core.gateway.sync(&document_id, version).await {
            Ok(sync) => core
                .broadcaster
                .send_frame(client_id, ServerFrame::from_sync(sync)),
            Err(err) => core
                .broadcaster
                .send_frame(client_id, ServerFrame::from_error(&err)),
        },
        ClientFrame::Heartbeat => {
            core.broadcaster
                .send_frame(client_id, ServerFrame::HeartbeatAck);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_the_wire_vocabulary() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"register","document_id":"doc-1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Register { .. }));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"cursor","document_id":"doc-1","position":4,"selection_start":1,"selection_end":4}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Cursor { position: 4, .. }));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Heartbeat));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let result: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"teleport","document_id":"doc-1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_error_frame_carries_code_and_hint() {
        let err = CoreError::RateLimited {
            scope: "ops".to_string(),
            retry_after: std::time::Duration::from_secs(3),
        };
        let frame = ServerFrame::from_error(&err);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "rate_limited");
        assert_eq!(json["retry_after_secs"], 3);
    }

    #[test]
    fn operation_frame_round_trips_batch_wire_shape() {
        let body = r#"{
            "type": "operation",
            "document_id": "doc-1",
            "batch": {
                "id": "b1",
                "user_id": "alice",
                "document_id": "doc-1",
                "version": 0,
                "operations": [{"type": "insert", "position": 0, "text": "hi"}],
                "timestamp": "2026-01-01T00:00:00Z",
                "source": "user"
            }
        }"#;
        let frame: ClientFrame = serde_json::from_str(body).unwrap();
        let ClientFrame::Operation { batch, .. } = frame else {
            panic!("expected operation frame");
        };
        assert_eq!(batch.base_version, 0);
        assert_eq!(batch.operations.len(), 1);
    }

    #[test]
    fn broadcaster_delivers_to_registered_clients() {
        let broadcaster = WsBroadcaster::new();
        let mut rx = broadcaster.register("c1");
        broadcaster.send_frame("c1", ServerFrame::HeartbeatAck);
        assert!(matches!(rx.try_recv().unwrap(), ServerFrame::HeartbeatAck));

        broadcaster.unregister("c1");
        assert_eq!(broadcaster.connected(), 0);
    }
}
