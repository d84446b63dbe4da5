//! WebSocket frames exchanged between a session and the backend
//!
//! Frames are JSON text, internally tagged by `type`. Results carry the
//! correlation handle of the submission they belong to; delivery order
//! across the channel is not guaranteed.

use serde::{Deserialize, Serialize};

use crate::message::CorrelationHandle;
use crate::owner::OwnerRef;

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Audio {
        handle: CorrelationHandle,
        /// Base64 audio, optionally as a `data:` URL
        payload: String,
        owner: OwnerRef,
        /// Recording length in seconds
        duration: f64,
        /// Client-side audio reference, echoed into the stored row
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
}

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Transcription {
        handle: CorrelationHandle,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        analysis: Option<String>,
    },
    Analysis {
        handle: CorrelationHandle,
        text: String,
    },
    AiReply {
        handle: CorrelationHandle,
        text: String,
    },
    Error {
        handle: CorrelationHandle,
        reason: String,
    },
}

impl ServerFrame {
    pub fn handle(&self) -> CorrelationHandle {
        match self {
            ServerFrame::Transcription { handle, .. }
            | ServerFrame::Analysis { handle, .. }
            | ServerFrame::AiReply { handle, .. }
            | ServerFrame::Error { handle, .. } => *handle,
        }
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerFrame::Transcription { .. } => "transcription",
            ServerFrame::Analysis { .. } => "analysis",
            ServerFrame::AiReply { .. } => "ai_reply",
            ServerFrame::Error { .. } => "error",
        }
    }
}

/// Strip an optional `data:<mime>;base64,` prefix from an audio payload
pub fn strip_data_url(payload: &str) -> &str {
    match payload.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    }
}
