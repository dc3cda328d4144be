//! Agent-side WebSocket handler (`/agent?session_id=…`).
//!
//! One connection per session, authenticated with an API-key credential
//! (bearer tokens are viewer-only). The socket carries framed binary data:
//! OUTPUT frames are appended to history and fanned out, RESIZE frames set
//! the authoritative window size, INPUT frames are never valid upstream and
//! are ignored. Closing the socket ends the session; the reaper drops it
//! once the retention window passes.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use common::auth::AuthError;
use common::frame::{
    decode_resize, FrameBuffer, FRAME_TYPE_INPUT, FRAME_TYPE_OUTPUT, FRAME_TYPE_RESIZE,
};
use common::session::Session;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::server::{CredentialBundle, RelayState};
use crate::viewer::reject_socket;

/// Queued frames awaiting the upstream socket writer.
const UPSTREAM_SEND_QUEUE: usize = 64;

pub(crate) async fn handle_agent(
    socket: WebSocket,
    state: RelayState,
    auth: Result<CredentialBundle, AuthError>,
    session_id: Option<String>,
) {
    let bundle = match auth {
        Ok(bundle) => bundle,
        Err(err) => {
            log::warn!("agent connection rejected: {err}");
            reject_socket(socket, err.wire_message()).await;
            return;
        }
    };
    let credentials = bundle.credentials;

    // Upstream requires an API key so the session can be scoped to it.
    let Some(api_key_hash) = credentials.api_key_hash else {
        log::warn!("agent connection with bearer credentials rejected");
        reject_socket(socket, "API key credentials required").await;
        return;
    };
    let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
        reject_socket(socket, "Missing session_id").await;
        return;
    };

    let session = state
        .manager
        .create(&credentials.owner_id, &session_id, &api_key_hash);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: frames queued by viewers (INPUT, RESIZE) drain to the
    // socket. The queue sender is the session's upstream handle; once the
    // session detaches or ends, the channel closes and the task exits.
    let (upstream_tx, mut upstream_rx) = mpsc::channel::<Vec<u8>>(UPSTREAM_SEND_QUEUE);
    session.attach_upstream(upstream_tx);

    let ready = json!({"type": "ready", "session_id": session_id}).to_string();
    if ws_tx.send(Message::Text(ready.into())).await.is_err() {
        session.end();
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = upstream_rx.recv().await {
            if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    });

    log::info!(
        "agent connected session={}:{}",
        credentials.owner_id,
        session_id
    );

    let mut frames = FrameBuffer::new();
    'outer: while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                frames.extend(&data);
                loop {
                    match frames.next_frame() {
                        Ok(Some((frame_type, payload))) => ingest(&session, frame_type, payload),
                        Ok(None) => break,
                        Err(err) => {
                            log::warn!(
                                "malformed upstream stream session={}:{}: {err}",
                                credentials.owner_id,
                                session_id
                            );
                            break 'outer;
                        }
                    }
                }
            }
            // Text is reserved for future control exchange.
            Ok(Message::Text(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }

    log::info!(
        "agent disconnected session={}:{}",
        credentials.owner_id,
        session_id
    );
    session.detach_upstream();
    session.end();
    // Detaching closed the queue; let the writer drain and finish.
    let _ = writer.await;
}

fn ingest(session: &Session, frame_type: u8, payload: Bytes) {
    match frame_type {
        FRAME_TYPE_OUTPUT => session.append_output(payload),
        FRAME_TYPE_RESIZE => match decode_resize(&payload) {
            Some((rows, cols)) if rows > 0 && cols > 0 => session.update_size(cols, rows),
            _ => log::debug!(
                "skipping malformed resize frame ({} bytes) session={}",
                payload.len(),
                session.session_id()
            ),
        },
        // Upstream must never send input; drop it.
        FRAME_TYPE_INPUT => {}
        other => log::debug!(
            "skipping unknown frame type {other} session={}",
            session.session_id()
        ),
    }
}
