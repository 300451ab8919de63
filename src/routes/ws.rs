//! Live task updates over WebSocket.
//!
//! The socket receives one JSON snapshot per poll and is closed by the server
//! after the first terminal snapshot.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use super::research::parse_task_id;
use crate::models::AppState;
use crate::tasks::watch_task;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{task_id}", get(task_updates))
        .with_state(state)
}

async fn task_updates(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| stream_snapshots(socket, state, task_id))
}

async fn stream_snapshots(socket: WebSocket, state: AppState, raw_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let not_found = json!({ "task_id": raw_id, "error": "Task not found" }).to_string();
    let Ok(task_id) = parse_task_id(&raw_id) else {
        let _ = sender.send(Message::Text(not_found.into())).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    let snapshots = watch_task(state.manager.clone(), task_id, state.config.tasks.poll_interval);
    futures::pin_mut!(snapshots);

    loop {
        tokio::select! {
            next = snapshots.next() => {
                let frame = match next {
                    Some(Ok(snapshot)) => match serde_json::to_string(&snapshot) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Could not encode snapshot");
                            break;
                        }
                    },
                    Some(Err(_)) => not_found.clone(),
                    None => break,
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    debug!(task_id = %task_id, "WebSocket client went away");
                    return;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!(task_id = %task_id, "WebSocket client disconnected");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
