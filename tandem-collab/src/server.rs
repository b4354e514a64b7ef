//! WebSocket front end.
//!
//! Each text frame carries one JSON [`ClientMessage`]; each outbound frame
//! one JSON [`Envelope`]. The first frame on a connection must be `join`.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::CollabError;
use crate::manager::{JoinRequest, SessionManager};
use crate::protocol::{ClientMessage, Envelope, ServerMessage};

/// Accepts WebSocket connections and bridges them into a [`SessionManager`].
pub struct SyncServer {
    manager: SessionManager,
}

impl SyncServer {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.manager.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        self.manager.start().await;
        log::info!("sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(manager, stream, addr).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// An unacknowledged `error` frame.
fn error_frame(err: &CollabError) -> Result<Message, CollabError> {
    let envelope = Envelope {
        message_id: 0,
        message: ServerMessage::error(err),
    };
    Ok(Message::text(envelope.encode()?))
}

async fn reject(ws: &mut WebSocketStream<TcpStream>, err: &CollabError) -> Result<(), CollabError> {
    ws.send(error_frame(err)?).await?;
    ws.close(None).await?;
    Ok(())
}

/// Read frames until the join arrives. Pings and pongs are skipped.
async fn read_join(
    ws: &mut WebSocketStream<TcpStream>,
) -> Result<Option<JoinRequest>, CollabError> {
    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(None),
            Message::Binary(_) => {
                return Err(CollabError::Protocol("binary frames are not supported".into()))
            }
            _ => continue,
        };
        return match ClientMessage::decode(text.as_str())? {
            ClientMessage::Join {
                session_id,
                name,
                client_id,
                last_versions,
            } => Ok(Some(JoinRequest {
                session_id,
                name,
                client_id,
                last_versions,
            })),
            other => Err(CollabError::Protocol(format!(
                "expected join, got {}",
                other.kind()
            ))),
        };
    }
    Ok(None)
}

async fn handle_connection(
    manager: SessionManager,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), CollabError> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    log::debug!("websocket connection established from {addr}");

    let request = match read_join(&mut ws).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => {
            log::warn!("rejecting {addr}: {err}");
            return reject(&mut ws, &err).await;
        }
    };

    let mut link = match manager.join(request).await {
        Ok(link) => link,
        Err(err) => {
            log::warn!("join from {addr} failed: {err}");
            return reject(&mut ws, &err).await;
        }
    };
    // Acks come from the remote client, frames are forwarded verbatim.
    link.set_auto_ack(false);
    log::info!(
        "client {} joined session {} from {addr}",
        link.client_id,
        link.session_id
    );

    let (mut ws_sender, mut ws_receiver) = ws.split();
    loop {
        tokio::select! {
            frame = link.recv_raw() => {
                let Some(frame) = frame else {
                    log::debug!("connection of {} closed by server", link.client_id);
                    break;
                };
                if ws_sender.send(Message::text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::decode(text.as_str()) {
                            Ok(ClientMessage::Join { .. }) => {
                                log::warn!("duplicate join from {}", link.client_id);
                            }
                            Ok(ClientMessage::Leave) => {
                                let _ = link.send(ClientMessage::Leave).await;
                                break;
                            }
                            Ok(message) => {
                                if link.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                log::warn!("bad frame from {}: {err}", link.client_id);
                                let sent = match error_frame(&err) {
                                    Ok(frame) => ws_sender.send(frame).await.is_ok(),
                                    Err(encode_err) => {
                                        log::error!("could not encode error: {encode_err}");
                                        true
                                    }
                                };
                                if !sent {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::debug!("websocket error from {addr}: {err}");
                        break;
                    }
                }
            }
        }
    }

    let _ = ws_sender.close().await;
    log::info!("client {} disconnected from {addr}", link.client_id);
    Ok(())
}
