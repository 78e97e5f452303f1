//! WebSocket Handler
//!
//! Socket loop for one client connection.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProtocolError;
use crate::hub::StreamHub;

use super::dispatch::{ConnectionContext, handle_text_frame, reject_frame};
use super::protocol::Envelope;
use super::registry::ConnectionIdentity;

/// Handle one streaming WebSocket connection until either side closes it or
/// the hub evicts it.
pub async fn handle_stream_ws(socket: WebSocket, hub: Arc<StreamHub>, identity: ConnectionIdentity) {
    info!(
        user = %identity.user_id,
        tenant = %identity.tenant_id,
        "New stream WebSocket connection"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(hub.config().outbound_queue_capacity);
    let close = CancellationToken::new();
    let connection_id = hub.connect(identity, tx, close.clone());
    let ctx = ConnectionContext::new(connection_id, Arc::clone(&hub));

    let sender_task = async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => handle_text_frame(&ctx, text.as_str()).await,
                Ok(Message::Binary(_)) => reject_frame(&ctx, ProtocolError::BinaryFrame),
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %connection_id, "Client closed connection");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = %connection_id, "WebSocket error: {}", e);
                    break;
                }
                // ping/pong are answered by axum
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %connection_id, "Sender task ended"),
        _ = input_task => debug!(conn_id = %connection_id, "Input task ended"),
        _ = close.cancelled() => warn!(conn_id = %connection_id, "Connection evicted"),
    }

    hub.disconnect(connection_id);
    info!(conn_id = %connection_id, "Stream WebSocket connection closed");
}
