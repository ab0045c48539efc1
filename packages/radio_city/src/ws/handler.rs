//! WebSocket Handler
//!
//! Per-socket glue: a writer draining the gateway's queue for this
//! connection and a reader feeding decoded frames back into the gateway.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::gateway::GatewayHandle;
use super::protocol::ClientMessage;
use super::registry::Outbound;
use crate::metrics::ServerMetrics;

/// Handle one listener WebSocket until either side goes away.
pub async fn handle_listener_ws(
    socket: WebSocket,
    gateway: GatewayHandle,
    metrics: Arc<ServerMetrics>,
) {
    let (connection_id, mut rx) = match gateway.connect().await {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Rejecting listener socket: {}", e);
            return;
        }
    };
    debug!(conn_id = %connection_id, "Listener socket open");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to send queued frames to the WebSocket
    let sender_task = async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Outbound::Text(json) => Message::Text(json.into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    };

    // Task to handle incoming frames
    let gateway_in = gateway.clone();
    let id_in = connection_id.clone();
    let metrics_in = metrics.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            let forwarded = match msg {
                Ok(Message::Text(text)) => {
                    metrics_in.message_received();
                    gateway_in
                        .inbound(&id_in, ClientMessage::decode(&text))
                        .await
                }
                Ok(Message::Pong(_)) => gateway_in.pong(&id_in).await,
                Ok(Message::Close(_)) => break,
                // Pings are answered by axum; binary frames are not part of the protocol
                Ok(_) => Ok(()),
                Err(e) => {
                    metrics_in.websocket_error();
                    debug!(conn_id = %id_in, "WebSocket receive error: {}", e);
                    break;
                }
            };
            if forwarded.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended"),
        _ = input_task => debug!("Input task ended"),
    }

    if gateway.disconnect(&connection_id).await.is_err() {
        debug!(conn_id = %connection_id, "Gateway already gone at disconnect");
    }
    info!(conn_id = %connection_id, "Listener socket closed");
}
