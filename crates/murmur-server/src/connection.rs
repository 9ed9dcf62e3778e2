use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use murmur_core::{ClientEvent, Handshake};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::client::{ClientId, ClientRegistry};
use crate::negotiate::{negotiate, Identity};
use crate::presence::{announce, greeting};
use crate::router::route_message;
use crate::services::Services;

/// Drive one WebSocket connection from handshake to disconnect.
pub async fn handle_connection(
    socket: WebSocket,
    handshake: Handshake,
    services: Services,
    registry: Arc<ClientRegistry>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) {
    let identity = negotiate(services.sessions.as_ref(), &handshake).await;
    let hello = match greeting(&identity) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode session event");
            return;
        }
    };
    // Queued before the client is visible, so no broadcast can overtake it.
    let (client_id, rx) = registry.register_with(hello);

    let span = tracing::info_span!(
        "connection",
        client_id = %client_id,
        session_id = %identity.session_id,
        user_id = %identity.user_id,
    );

    run(socket, client_id, rx, identity, services, registry, heartbeat, shutdown)
        .instrument(span)
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn run(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    identity: Identity,
    services: Services,
    registry: Arc<ClientRegistry>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!(username = %identity.username, resumed = identity.resumed, "Client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: queued frames out, plus a ping every heartbeat.
    let mut writer = tokio::spawn(
        async move {
            let mut ping_interval = tokio::time::interval(heartbeat);
            ping_interval.tick().await;

            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        let Some(text) = frame else { break };
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                        tracing::trace!("Sent ping");
                    }
                }
            }
            let _ = ws_tx.close().await;
        }
        .in_current_span(),
    );

    // The roster goes out through the bus, so the writer must be running first.
    if let Err(e) = announce(&services, &registry, &client_id, &identity).await {
        tracing::error!(error = %e, "Failed to announce connection");
    }

    // Reader: inbound frames are handled one at a time, in arrival order.
    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(
        async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    WsMessage::Text(text) => {
                        handle_frame(&services, &identity, text.as_str()).await;
                    }
                    WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }
        .in_current_span(),
    );

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
        _ = shutdown.cancelled() => {},
    }
    reader.abort();

    // Dropping the registry entry closes the queue, which lets the writer finish.
    registry.unregister(&client_id);
    tracing::info!("Client disconnected");
}

async fn handle_frame(services: &Services, identity: &Identity, text: &str) {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, frame_len = text.len(), "Dropping inbound frame");
            return;
        }
    };

    match event {
        ClientEvent::NewMessage(request) => {
            if let Err(e) = route_message(services, identity, request).await {
                tracing::error!(error = %e, "Failed to route message");
            }
        }
    }
}
