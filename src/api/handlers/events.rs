//! WebSocket event stream

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::api::AppState;
use crate::events::Event;

pub async fn subscribe(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| forward(socket, events))
}

/// Push every broadcast event to the socket until either side goes away.
async fn forward(mut socket: WebSocket, mut events: broadcast::Receiver<Event>) {
    debug!("events: Client connected");
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "events: Client lagging, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = %event.name, "events: Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("events: Client disconnected");
}
