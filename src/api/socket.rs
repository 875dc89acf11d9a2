//! Device WebSocket endpoint
//!
//! Each connected socket gets an outbound pump task draining its
//! registry channel, and an inbound loop that decodes envelopes and
//! dispatches them by type. Registration upgrades the connection from
//! pending to active; on close, cleanup targets exactly the binding
//! this socket owns.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};

use super::ApiState;
use crate::registry::{ConnectionRegistry, ConnectionToken};
use crate::wire::{DeviceMessage, GatewayMessage};

/// Identity a socket task carries through its lifetime
enum SocketIdentity {
    Pending(String),
    Registered {
        device_id: String,
        token: ConnectionToken,
    },
}

/// Build the device WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws/device", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade for device connections
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a connected device socket
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sink, mut stream) = socket.split();
    let registry = Arc::clone(&state.registry);

    // Outbound pump: the registry writes envelopes into this channel;
    // dropping the sender (displacement, sweep) ends the pump and the
    // socket with it.
    let (tx, mut rx) = mpsc::channel::<GatewayMessage>(state.outbound_buffer);
    let mut pump = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode outbound envelope"),
            }
        }
        let _ = sink.close().await;
    });

    // Only the registry holds a strong sender: displacement or a sweep
    // dropping it closes the channel, which ends the pump and the socket.
    let reply = tx.downgrade();
    let pending_id = registry.accept(tx).await;
    // Shared with the inbound loop so teardown sees the final identity
    // no matter which side of the select ends first.
    let identity = Arc::new(Mutex::new(SocketIdentity::Pending(pending_id)));
    tracing::debug!("device socket connected, awaiting identification");

    let mut recv_task = {
        let registry = Arc::clone(&registry);
        let identity = Arc::clone(&identity);
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Text(text) => {
                        let mut identity = identity.lock().await;
                        handle_frame(&registry, &reply, &mut identity, &text).await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        send_error(&reply, "invalid message");
                    }
                }
            }
        })
    };

    // Either side ending tears the connection down. A sink write error
    // ends the pump while the binding is still in the registry, so
    // cleanup cannot depend on which side finished first.
    tokio::select! {
        _ = &mut recv_task => pump.abort(),
        _ = &mut pump => recv_task.abort(),
    }

    match &*identity.lock().await {
        SocketIdentity::Pending(pending_id) => {
            registry.drop_pending(pending_id).await;
            tracing::debug!("unregistered device socket closed");
        }
        SocketIdentity::Registered { device_id, token } => {
            // Direct binding from registration; never a table scan. The
            // token compare makes this a no-op for a connection that was
            // already displaced or swept. The liveness sweep owns the
            // OFFLINE transition.
            registry.drop_connection(device_id, token).await;
        }
    };
}

/// Decode and dispatch one inbound frame
async fn handle_frame(
    registry: &Arc<ConnectionRegistry>,
    tx: &mpsc::WeakSender<GatewayMessage>,
    identity: &mut SocketIdentity,
    text: &str,
) {
    let Ok(message) = serde_json::from_str::<DeviceMessage>(text) else {
        send_error(tx, "invalid message");
        return;
    };

    match message {
        DeviceMessage::Register {
            uuid,
            name,
            metadata,
        } => {
            let SocketIdentity::Pending(pending_id) = &*identity else {
                tracing::warn!("duplicate registration ignored");
                return;
            };

            match registry
                .register(pending_id, &uuid, name.as_deref(), metadata.as_ref())
                .await
            {
                Ok((device, token)) => {
                    *identity = SocketIdentity::Registered {
                        device_id: device.id,
                        token,
                    };
                }
                Err(e) => {
                    tracing::warn!(error = %e, "registration rejected");
                    send_error(tx, e.device_message());
                }
            }
        }
        DeviceMessage::Heartbeat { device_id } => {
            if let Err(e) = registry.heartbeat(&device_id).await {
                send_error(tx, e.device_message());
            }
        }
        DeviceMessage::CommandResult {
            command_id,
            result,
            error,
        } => {
            // Results are accepted from the connection that executed the
            // command; an unbound connection gets rejected like heartbeats
            if matches!(identity, SocketIdentity::Pending(_)) {
                send_error(tx, "device not registered");
                return;
            }
            if let Err(e) = registry.record_result(&command_id, result.as_ref(), error.as_deref())
            {
                tracing::error!(command_id = %command_id, error = %e, "failed to record result");
            }
        }
    }
}

fn send_error(tx: &mpsc::WeakSender<GatewayMessage>, message: &str) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.try_send(GatewayMessage::Error {
            message: message.to_string(),
        });
    }
}
