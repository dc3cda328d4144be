//! WebSocket client for the relay's upstream endpoint.
//!
//! The connection is an optional augmentation: any failure here is logged
//! and the wrapper keeps running locally. Outgoing traffic is pre-framed
//! (OUTPUT and RESIZE frames built by the run loop); incoming frames are
//! decoded and only INPUT payloads are surfaced.

use anyhow::{Context, Result};
use bytes::Bytes;
use common::config::WrapperConfig;
use common::frame::{FrameBuffer, FRAME_TYPE_INPUT};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_DEPTH: usize = 256;

/// A live relay connection: framed bytes out, INPUT payloads in.
///
/// Dropping `outgoing` closes the socket; `incoming` yielding `None` means
/// the relay went away.
pub struct RelayConnection {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Bytes>,
}

pub async fn connect(config: &WrapperConfig, session_id: &str) -> Result<RelayConnection> {
    let api_key = config
        .api_key
        .as_deref()
        .context("OMNARA_API_KEY is not set")?;

    let url = config.relay_ws_url(session_id);
    let mut request = url
        .as_str()
        .into_client_request()
        .context("invalid relay URL")?;
    request.headers_mut().insert(
        "X-API-Key",
        HeaderValue::from_str(api_key).context("API key is not a valid header value")?,
    );

    let (stream, _response) =
        tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .context("relay connection timed out")?
            .context("relay connection failed")?;
    log::info!("connected to relay at {url}");

    let (mut ws_tx, mut ws_rx) = stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
    let (incoming_tx, incoming_rx) = mpsc::channel::<Bytes>(QUEUE_DEPTH);

    // Writer: drain pre-framed bytes to the socket, close when the run loop
    // drops its sender.
    tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if ws_tx.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Reader: reassemble frames, surface INPUT payloads only.
    tokio::spawn(async move {
        let mut frames = FrameBuffer::new();
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    frames.extend(&data);
                    loop {
                        match frames.next_frame() {
                            Ok(Some((FRAME_TYPE_INPUT, payload))) => {
                                if incoming_tx.send(payload).await.is_err() {
                                    return;
                                }
                            }
                            Ok(Some((other, _))) => {
                                log::debug!("ignoring downstream frame type {other}");
                            }
                            Ok(None) => break,
                            Err(err) => {
                                log::warn!("malformed downstream stream: {err}");
                                return;
                            }
                        }
                    }
                }
                Ok(Message::Text(text)) => handle_control(&text),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    Ok(RelayConnection {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
    })
}

/// JSON control messages from the relay: a `ready` ack on attach, or an
/// error explaining why the connection is about to close.
fn handle_control(text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) if value.get("type").and_then(|t| t.as_str()) == Some("ready") => {
            log::info!("relay session ready");
        }
        Ok(value) if value.get("error").is_some() => {
            log::warn!("relay reported an error: {}", value["error"]);
        }
        _ => log::debug!("unrecognized relay control message: {text}"),
    }
}
