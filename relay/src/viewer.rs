//! Viewer-side WebSocket handler (`/terminal`).
//!
//! Control messages are JSON text; terminal data is binary OUTPUT frames.
//! On accept the viewer gets its session list; after `join_session` it gets
//! the current size, the full history, then live events. A viewer that
//! cannot keep up (failed send or lagged broadcast) is disconnected without
//! disturbing the upstream or other viewers.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use common::auth::AuthError;
use common::frame::{pack_frame, FRAME_TYPE_OUTPUT};
use common::session::{Session, SessionEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::server::{CredentialBundle, RelayState};

/// Messages a viewer may send after the handshake.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ViewerCommand {
    JoinSession {
        session_id: Option<String>,
    },
    Input {
        data: String,
        cols: Option<u16>,
        rows: Option<u16>,
    },
    ResizeRequest {
        cols: Option<u16>,
        rows: Option<u16>,
    },
}

/// WebSocket close code for policy violations.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Send a JSON error then close with a policy-violation code (1008).
pub(crate) async fn reject_socket(mut socket: WebSocket, message: &str) {
    let _ = socket
        .send(Message::Text(json!({"error": message}).to_string().into()))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "auth".into(),
        })))
        .await;
}

pub(crate) async fn handle_terminal(
    socket: WebSocket,
    state: RelayState,
    auth: Result<CredentialBundle, AuthError>,
) {
    let bundle = match auth {
        Ok(bundle) => bundle,
        Err(err) => {
            log::warn!("viewer connection rejected: {err}");
            reject_socket(socket, err.wire_message()).await;
            return;
        }
    };
    let credentials = bundle.credentials;

    let (mut ws_tx, mut ws_rx) = socket.split();

    let descriptors: Vec<_> = state
        .manager
        .sessions_for(&credentials.owner_id, credentials.api_key_hash.as_deref())
        .iter()
        .map(|session| session.descriptor())
        .collect();
    if send_json(&mut ws_tx, &json!({"type": "sessions", "sessions": descriptors}))
        .await
        .is_err()
    {
        return;
    }

    // Idle until the viewer picks a session; a failed join keeps the socket
    // open so the client can try another id.
    let mut joined: Option<Arc<Session>> = None;
    while joined.is_none() {
        let Some(Ok(msg)) = ws_rx.next().await else {
            return;
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };
        let command = match serde_json::from_str::<ViewerCommand>(&text) {
            Ok(command) => command,
            Err(err) => {
                log::debug!("ignoring unparseable viewer message: {err}");
                continue;
            }
        };
        let ViewerCommand::JoinSession { session_id } = command else {
            continue;
        };
        let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
            if send_json(&mut ws_tx, &json!({"error": "Missing session_id"}))
                .await
                .is_err()
            {
                return;
            }
            continue;
        };
        match state.manager.get(
            &credentials.owner_id,
            &session_id,
            credentials.api_key_hash.as_deref(),
        ) {
            Some(session) => joined = Some(session),
            None => {
                if send_json(&mut ws_tx, &json!({"error": "Session not found"}))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    if let Some(session) = joined {
        log::info!(
            "viewer joined session={}:{}",
            credentials.owner_id,
            session.session_id()
        );
        run_joined(&mut ws_tx, &mut ws_rx, &session).await;
        log::info!(
            "viewer left session={}:{}",
            credentials.owner_id,
            session.session_id()
        );
    }
}

/// Stream one session to a joined viewer until either side gives up.
///
/// Ordering contract: the size hint, then every history chunk in append
/// order, then live events in broadcast order. `Session::join` snapshots
/// history and subscribes atomically, so nothing is lost or duplicated in
/// between.
async fn run_joined(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
    session: &Arc<Session>,
) {
    let mut join = session.join();

    let size_hint = json!({
        "type": "resize",
        "session_id": session.session_id(),
        "cols": join.cols,
        "rows": join.rows,
    });
    if send_json(ws_tx, &size_hint).await.is_err() {
        return;
    }

    for chunk in join.history.drain(..) {
        let frame = pack_frame(FRAME_TYPE_OUTPUT, &chunk);
        if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = join.events.recv() => match event {
                Ok(SessionEvent::Output(chunk)) => {
                    let frame = pack_frame(FRAME_TYPE_OUTPUT, &chunk);
                    if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                        return;
                    }
                }
                Ok(SessionEvent::Resize { cols, rows }) => {
                    let event = json!({
                        "type": "resize",
                        "session_id": session.session_id(),
                        "cols": cols,
                        "rows": rows,
                    });
                    if send_json(ws_tx, &event).await.is_err() {
                        return;
                    }
                }
                Ok(SessionEvent::Ended) => {
                    let event = json!({
                        "type": "session_ended",
                        "session_id": session.session_id(),
                    });
                    if send_json(ws_tx, &event).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // A lagging viewer would otherwise see a gap in the byte
                    // stream; disconnect it instead.
                    log::warn!(
                        "viewer lagged {skipped} events session={}, dropping",
                        session.session_id()
                    );
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ViewerCommand>(&text) {
                        Ok(ViewerCommand::Input { data, cols, rows }) => {
                            session.forward_input(&data);
                            if cols.is_some() || rows.is_some() {
                                session.request_resize(cols, rows);
                            }
                        }
                        Ok(ViewerCommand::ResizeRequest { cols, rows }) => {
                            session.request_resize(cols, rows);
                        }
                        Ok(ViewerCommand::JoinSession { .. }) => {}
                        Err(err) => log::debug!("ignoring unparseable viewer message: {err}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
        }
    }
}

async fn send_json(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    value: &serde_json::Value,
) -> Result<(), axum::Error> {
    ws_tx.send(Message::Text(value.to_string().into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_session_parses() {
        let command: ViewerCommand =
            serde_json::from_str(r#"{"type":"join_session","session_id":"S1"}"#).unwrap();
        assert!(matches!(
            command,
            ViewerCommand::JoinSession { session_id: Some(id) } if id == "S1"
        ));
    }

    #[test]
    fn test_join_session_without_id_parses() {
        let command: ViewerCommand = serde_json::from_str(r#"{"type":"join_session"}"#).unwrap();
        assert!(matches!(
            command,
            ViewerCommand::JoinSession { session_id: None }
        ));
    }

    #[test]
    fn test_input_with_optional_resize_parses() {
        let command: ViewerCommand =
            serde_json::from_str(r#"{"type":"input","data":"ls\n","cols":120,"rows":30}"#).unwrap();
        match command {
            ViewerCommand::Input { data, cols, rows } => {
                assert_eq!(data, "ls\n");
                assert_eq!(cols, Some(120));
                assert_eq!(rows, Some(30));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_input_without_dimensions_parses() {
        let command: ViewerCommand =
            serde_json::from_str(r#"{"type":"input","data":"x"}"#).unwrap();
        assert!(matches!(
            command,
            ViewerCommand::Input { cols: None, rows: None, .. }
        ));
    }

    #[test]
    fn test_resize_request_parses() {
        let command: ViewerCommand =
            serde_json::from_str(r#"{"type":"resize_request","cols":100,"rows":40}"#).unwrap();
        assert!(matches!(
            command,
            ViewerCommand::ResizeRequest { cols: Some(100), rows: Some(40) }
        ));
    }

    #[test]
    fn test_unknown_message_type_is_an_error() {
        assert!(serde_json::from_str::<ViewerCommand>(r#"{"type":"shutdown"}"#).is_err());
    }
}
