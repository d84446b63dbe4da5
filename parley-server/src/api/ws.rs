//! Audio submission WebSocket
//!
//! Every `audio` frame is processed on its own task, so results for
//! several submissions on one socket may come back in any order. Each
//! result frame carries the handle of the submission it answers.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use base64::prelude::*;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parley_common::wire::{strip_data_url, ClientFrame, ServerFrame};
use parley_common::{
    CorrelationHandle, Message, MessageContent, MessageId, MessageStatus, MessageStore, OwnerRef,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::analyzer::{self, Analyzer};
use crate::AppState;

const OUTBOUND_BUFFER: usize = 64;

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One decoded `audio` frame
#[derive(Debug, Clone)]
struct Submission {
    handle: CorrelationHandle,
    payload: String,
    owner: OwnerRef,
    duration_secs: f64,
    reference: Option<String>,
    received_at: DateTime<Utc>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to encode result frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                debug!("WebSocket closed while sending results");
                break;
            }
        }
    });

    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Audio {
                    handle,
                    payload,
                    owner,
                    duration,
                    reference,
                }) => {
                    debug!(%handle, %owner, "Audio frame received");
                    let submission = Submission {
                        handle,
                        payload,
                        owner,
                        duration_secs: duration,
                        reference,
                        received_at: Utc::now(),
                    };
                    tokio::spawn(process_submission(state.clone(), submission, out_tx.clone()));
                }
                Err(e) => warn!(error = %e, "Ignoring malformed frame"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // in-flight submissions hold their own senders; the writer drains them
    drop(out_tx);
    if let Err(e) = writer.await {
        warn!(error = %e, "WebSocket writer task failed");
    }
    info!("WebSocket client disconnected");
}

async fn process_submission(
    state: AppState,
    submission: Submission,
    out: mpsc::Sender<ServerFrame>,
) {
    let handle = submission.handle;
    let fail = |reason: String| ServerFrame::Error { handle, reason };

    let audio = match BASE64_STANDARD.decode(strip_data_url(&submission.payload)) {
        Ok(audio) => audio,
        Err(e) => {
            warn!(%handle, error = %e, "Undecodable audio payload");
            let _ = out.send(fail(format!("invalid audio payload: {}", e))).await;
            return;
        }
    };

    let Some(analyzer) = state.analyzer.clone() else {
        let _ = out
            .send(fail("audio analysis is not configured".to_string()))
            .await;
        return;
    };

    let transcribed = match analyzer::transcribe_and_analyse(analyzer.as_ref(), &audio).await {
        Ok(transcribed) => transcribed,
        Err(e) => {
            warn!(%handle, error = %e, "Transcription failed");
            let _ = out.send(fail(format!("transcription failed: {}", e))).await;
            return;
        }
    };

    let _ = out
        .send(ServerFrame::Transcription {
            handle,
            text: transcribed.text.clone(),
            analysis: transcribed.analysis.clone(),
        })
        .await;

    let owner = resolve_owner(state.store.as_ref(), submission.owner.clone()).await;
    persist(
        state.store.as_ref(),
        user_row(&submission, owner.clone(), &transcribed.text),
    )
    .await;
    if let Some(analysis) = transcribed.analysis {
        persist(
            state.store.as_ref(),
            Message::ai(owner.clone(), handle, MessageContent::AiAnalysis { text: analysis }, Utc::now()),
        )
        .await;
    }

    match reply(analyzer.as_ref(), &transcribed.text).await {
        Ok(text) => {
            let _ = out
                .send(ServerFrame::AiReply {
                    handle,
                    text: text.clone(),
                })
                .await;
            persist(
                state.store.as_ref(),
                Message::ai(owner, handle, MessageContent::AiReply { text }, Utc::now()),
            )
            .await;
            info!(%handle, "Submission answered");
        }
        Err(reason) => {
            let _ = out.send(fail(reason)).await;
        }
    }
}

async fn reply(analyzer: &dyn Analyzer, transcription: &str) -> Result<String, String> {
    analyzer.reply(transcription).await.map_err(|e| {
        warn!(error = %e, "Reply generation failed");
        format!("reply failed: {}", e)
    })
}

/// Completed user-audio row for a transcribed submission
fn user_row(submission: &Submission, owner: OwnerRef, transcription: &str) -> Message {
    Message {
        id: MessageId::generate(),
        owner,
        content: MessageContent::UserAudio {
            reference: submission
                .reference
                .clone()
                .unwrap_or_else(|| format!("ws:{}", submission.handle)),
            duration_secs: submission.duration_secs,
            transcription: Some(transcription.to_string()),
        },
        status: MessageStatus::Completed,
        created_at: submission.received_at,
        handle: Some(submission.handle),
    }
}

/// Rows for a token that has since been merged belong to the user
async fn resolve_owner(store: &dyn MessageStore, owner: OwnerRef) -> OwnerRef {
    let OwnerRef::Anonymous(anonymous_id) = &owner else {
        return owner;
    };
    match store.find_merge(anonymous_id).await {
        Ok(Some(record)) => {
            debug!(anonymous = %anonymous_id, user = %record.user_id, "Attributing late row to merged user");
            OwnerRef::User(record.user_id)
        }
        Ok(None) => owner,
        Err(e) => {
            warn!(error = %e, "Merge lookup failed, keeping anonymous owner");
            owner
        }
    }
}

async fn persist(store: &dyn MessageStore, message: Message) {
    let id = message.id;
    if let Err(e) = store.insert(message).await {
        error!(message_id = %id, error = %e, "Failed to persist message");
    }
}
