//! WebSocket server: one socket per (client, document).
//!
//! ```text
//! TcpListener ──accept──► handle_connection (one task per socket)
//!                              │
//!                              ├─ handshake: /ws/{docId}?userId&color → 404 / 400
//!                              ├─ registry.ensure_session(docId)
//!                              ├─ session.join → init frame
//!                              └─ select! loop
//!                                   ├─ inbound text frame → apply_and_broadcast
//!                                   └─ outbound queue     → text frame
//! ```
//!
//! The socket task is the only writer to its socket. The session reaches it
//! through the connection's outbound queue, never directly.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::CollabError;
use crate::operation::{DocumentId, Operation};
use crate::presence::color_for_user;
use crate::protocol::{decode_operation, encode_operation, ConnectRequest, ProtocolError, ServerMessage};
use crate::registry::SessionRegistry;

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let outbound_capacity = self.config.outbound_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, outbound_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<AtomicServerStats>,
        outbound_capacity: usize,
    ) -> Result<(), CollabError> {
        let mut request = None;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
            match ConnectRequest::parse(target) {
                Ok(parsed) => {
                    request = Some(parsed);
                    Ok(resp)
                }
                Err(e) => {
                    log::warn!("Rejected handshake from {addr}: {e}");
                    Err(reject(&e))
                }
            }
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        let Some(request) = request else {
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let document_id = request.document_id;
        let user_id = request.user_id.unwrap_or_else(|| format!("anon-{addr}"));
        let color = request.color.unwrap_or_else(|| color_for_user(&user_id));

        let session = match registry.ensure_session(&document_id).await {
            Ok(session) => session,
            Err(e) => {
                let frame = CloseFrame {
                    code: CloseCode::Error,
                    reason: "failed to load document".into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return Err(e);
            }
        };

        let (conn, mut outbound) = Connection::new(user_id.clone(), outbound_capacity);
        let conn_id = conn.id();
        let state = session.join(conn).await;

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("{user_id} ({conn_id}) joined {document_id} from {addr}");

        let init = ServerMessage::init(document_id.clone(), state.text, state.presence).encode()?;
        let mut result = ws_sender.send(Message::text(init)).await.map_err(CollabError::from);

        while result.is_ok() {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            match decode_operation(text.as_str()) {
                                Ok(mut op) => {
                                    stamp_inbound(&mut op, &document_id, &user_id, &color);
                                    session.apply_and_broadcast(op, conn_id).await;
                                }
                                Err(e) => {
                                    stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Skipping frame from {user_id} on {document_id}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            result = ws_sender.send(Message::Pong(data)).await.map_err(CollabError::from);
                        }
                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Ignoring binary frame from {user_id} on {document_id}");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("{user_id} ({conn_id}) left {document_id}");
                            break;
                        }
                        Some(Err(e)) => {
                            result = Err(e.into());
                        }
                        _ => {}
                    }
                }

                op = outbound.recv() => {
                    match op {
                        Some(op) => match encode_operation(&op) {
                            Ok(json) => {
                                result = ws_sender.send(Message::text(json)).await.map_err(CollabError::from);
                            }
                            Err(e) => log::error!("Failed to encode {}: {e}", op.operation_id),
                        },
                        None => {
                            // Evicted by the session after a missed operation
                            log::info!("{user_id} ({conn_id}) fell behind on {document_id}, closing");
                            let frame = CloseFrame {
                                code: CloseCode::Again,
                                reason: "fell behind, rejoin".into(),
                            };
                            let _ = ws_sender.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
            }
        }

        session.remove_connection(conn_id).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Overwrite the fields a client may not choose.
///
/// Document id and source come from the socket; cursor colour from the
/// handshake. Clients that send no operation id get a fresh one.
pub fn stamp_inbound(op: &mut Operation, document_id: &DocumentId, user_id: &str, color: &str) {
    op.document_id = document_id.clone();
    op.source = user_id.to_string();
    if op.is_cursor() {
        op.user_color = Some(color.to_string());
    }
    if op.operation_id.is_nil() {
        op.operation_id = Uuid::new_v4();
    }
}

fn reject(err: &ProtocolError) -> ErrorResponse {
    let status = match err {
        ProtocolError::UnknownRoute(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}
