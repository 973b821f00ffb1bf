//! Streaming retrieval over WebSocket.
//!
//! The client's first text frame is a JSON [`DigestRequest`]. Every progress
//! event is pushed as a `progress` message, followed by exactly one terminal
//! message (`digest_complete`, `error` or `cancelled`) after which the socket
//! is closed. If the client goes away the operation is cancelled and nothing
//! more is sent.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use gitscape_core::progress::{ChannelSink, ProgressEvent};
use gitscape_core::{Acquirer, Digest, DigestError, DigestRequest, DigestSummary, ErrorKind};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// Messages pushed to the client.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Progress {
        #[serde(flatten)]
        event: &'a ProgressEvent,
    },
    DigestComplete {
        digest: String,
        summary: &'a DigestSummary,
        tree: &'a str,
        percentage: u8,
    },
    Error {
        kind: ErrorKind,
        message: String,
        percentage: u8,
    },
    Cancelled {
        message: &'static str,
    },
}

impl<'a> ServerMessage<'a> {
    fn outcome(outcome: &'a Result<Digest, DigestError>) -> Self {
        match outcome {
            Ok(digest) => ServerMessage::DigestComplete {
                digest: digest.to_markdown(),
                summary: &digest.summary,
                tree: &digest.tree,
                percentage: 100,
            },
            Err(DigestError::Cancelled) => ServerMessage::Cancelled {
                message: "Operation cancelled.",
            },
            Err(e) => ServerMessage::Error {
                kind: e.kind(),
                message: e.to_string(),
                percentage: 100,
            },
        }
    }
}

type Sender = SplitSink<WebSocket, WsMessage>;

async fn send(sender: &mut Sender, message: &ServerMessage<'_>) -> Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|e| {
        warn!(error = ?e, "Failed to serialise message");
    })?;
    sender
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| debug!(error = ?e, "WebSocket send failed"))
}

/// WebSocket upgrade handler.
pub async fn ws_handler<A: Acquirer + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<A>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Wait for the first text frame and parse it as a request.
async fn read_request(receiver: &mut SplitStream<WebSocket>) -> Option<Result<DigestRequest, DigestError>> {
    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            WsMessage::Text(text) => {
                return Some(
                    serde_json::from_str::<DigestRequest>(text.as_str())
                        .map_err(|e| DigestError::InvalidRequest(format!("malformed request: {e}"))),
                )
            }
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}

enum Step {
    Event(ProgressEvent),
    Finished(Result<Digest, DigestError>),
    Disconnected,
}

async fn handle_socket<A: Acquirer + 'static>(socket: WebSocket, state: AppState<A>) {
    let (mut sender, mut receiver) = socket.split();
    info!("WebSocket client connected");

    let request = match read_request(&mut receiver).await {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            let outcome = Err(e);
            let _ = send(&mut sender, &ServerMessage::outcome(&outcome)).await;
            let _ = sender.close().await;
            return;
        }
        None => {
            debug!("WebSocket closed before a request arrived");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let run = state.digest(request, Arc::new(ChannelSink::new(tx)), cancel.clone());
    tokio::pin!(run);

    let outcome = loop {
        let step = tokio::select! {
            biased;
            Some(event) = rx.recv() => Step::Event(event),
            outcome = &mut run => Step::Finished(outcome),
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => Step::Disconnected,
                Some(Ok(_)) => continue,
            },
        };
        match step {
            Step::Event(event) => {
                if send(&mut sender, &ServerMessage::Progress { event: &event }).await.is_err() {
                    break None;
                }
            }
            Step::Finished(outcome) => break Some(outcome),
            Step::Disconnected => break None,
        }
    };

    let Some(outcome) = outcome else {
        info!("WebSocket client disconnected, cancelling digest");
        cancel.cancel();
        // Let the pipeline unwind and dispose its workspace.
        let _ = run.await;
        return;
    };

    while let Ok(event) = rx.try_recv() {
        if send(&mut sender, &ServerMessage::Progress { event: &event }).await.is_err() {
            return;
        }
    }
    let _ = send(&mut sender, &ServerMessage::outcome(&outcome)).await;
    let _ = sender.close().await;
    info!(success = outcome.is_ok(), "WebSocket digest finished");
}
