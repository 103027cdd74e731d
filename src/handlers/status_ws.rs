//! Per-document status stream. A client connects once per document and
//! receives a snapshot immediately, then another each time ingestion
//! progresses or a chat answer completes.

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::StreamExt;
use tracing::debug;

use crate::state::AppState;
use crate::store::models::DocumentId;

pub async fn status_stream(
    ws: WebSocketUpgrade,
    Path(document_id): Path<DocumentId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, document_id, state))
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, document_id: DocumentId, state: AppState) {
    let (sink, mut stream) = socket.split();
    let connection_id = state.status_broadcaster.register(document_id, sink);

    state.status_aggregator.aggregate_and_broadcast(document_id).await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    state.status_broadcaster.disconnect(document_id, connection_id);
    debug!("websocket disconnected for document {document_id}");
}
