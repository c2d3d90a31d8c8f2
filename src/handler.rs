//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, frame
//! decoding, and bidirectional communication with the ChatServer.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::message::{self, ServerMessage};
use crate::registry::{connection_link, LinkReceiver, Outbound};
use crate::server::ServerCommand;
use crate::types::ConnId;

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, registers the connection with the
/// ChatServer and pumps frames both ways until either side closes.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    outbound_buffer: usize,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id = ConnId::new();
    info!("Connection {} opened from {}", conn_id, peer_addr);

    let (link, outbound) = connection_link(outbound_buffer);
    let LinkReceiver {
        frames: mut out_rx,
        close: mut close_rx,
    } = outbound;
    let out_tx = link.frames.clone();

    if cmd_tx
        .send(ServerCommand::Connect { conn_id, link })
        .await
        .is_err()
    {
        error!("Failed to register connection {} - server closed", conn_id);
        return Err(AppError::ChannelSend);
    }

    let cmd_tx_read = cmd_tx.clone();

    // Read task (WebSocket -> ServerCommand), one frame in flight at a time
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match message::decode(&text) {
                    Ok(message) => {
                        let (done_tx, done_rx) = oneshot::channel();
                        let cmd = ServerCommand::Frame {
                            conn_id,
                            message,
                            done: Some(done_tx),
                        };
                        if cmd_tx_read.send(cmd).await.is_err() {
                            debug!("Server closed, ending read task for {}", conn_id);
                            break;
                        }
                        // Dropped without a signal only when the server is gone
                        if done_rx.await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Rejected frame from {}: {}", conn_id, e);
                        reply_error(&out_tx, conn_id, e);
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", conn_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Control frames are answered by tungstenite
                    debug!("Control frame from {}", conn_id);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("WebSocket error for {}: {}", conn_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", conn_id);
    });

    // Write task (Outbound -> WebSocket). The close signal bypasses the
    // frame queue so a full queue cannot hold back an eviction.
    let mut write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                reason = &mut close_rx => {
                    let reason = reason.unwrap_or_else(|_| "Server closed connection".to_string());
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
                item = out_rx.recv() => {
                    let Some(json) = item else {
                        break;
                    };
                    if ws_sender
                        .send(Message::Text(json.to_string().into()))
                        .await
                        .is_err()
                    {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
        debug!("Write task ended");
    });

    // Whichever side finishes first takes the other down with it
    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", conn_id);
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", conn_id);
        }
    }
    read_task.abort();
    write_task.abort();

    let _ = cmd_tx.send(ServerCommand::Disconnect { conn_id }).await;
    info!("Connection {} closed", conn_id);

    Ok(())
}

/// Queue an error frame directly, for frames that never reach the server
fn reply_error(out_tx: &mpsc::Sender<Outbound>, conn_id: ConnId, err: AppError) {
    match ServerMessage::error(err).encode() {
        Ok(json) => {
            if out_tx.try_send(Arc::from(json)).is_err() {
                warn!("Could not queue error frame for {}", conn_id);
            }
        }
        Err(e) => error!("Failed to serialize error frame: {}", e),
    }
}
