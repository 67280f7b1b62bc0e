use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Push every produced value to the client until either side goes away.
///
/// Only a weak reference to the connection is held here, so once the registry
/// drops it (failed send or shutdown) the queue closes and the session ends.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.client_queue);
    let connection = state.registry.subscribe(tx);
    let id = connection.id();
    let connection: Weak<_> = Arc::downgrade(&connection);
    info!(connection_id = %id, "Client connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(payload) = outbound else {
                    debug!(connection_id = %id, "Connection released by registry");
                    break;
                };
                if sender.send(Message::Text(payload.as_ref().into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                // Client-to-server text is ignored.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if let Some(connection) = connection.upgrade() {
        state.registry.unsubscribe(&connection);
    }
    info!(connection_id = %id, "Client disconnected");
}
