//! Chat message model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::owner::OwnerRef;
use crate::{Error, Result};

/// Unique message identifier
///
/// Client-generated for optimistic entries, server-generated for confirmed
/// rows. Equality of ids is never used to join results to submissions; see
/// [`CorrelationHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("Invalid message id '{}': {}", s, e)))
    }
}

/// Key minted at submission and echoed back with every asynchronous result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationHandle(Uuid);

impl CorrelationHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CorrelationHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("Invalid correlation handle '{}': {}", s, e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    UserAudio,
    AiTranscription,
    AiAnalysis,
    AiReply,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::UserAudio => "user-audio",
            MessageKind::AiTranscription => "ai-transcription",
            MessageKind::AiAnalysis => "ai-analysis",
            MessageKind::AiReply => "ai-reply",
        }
    }

    pub fn is_ai(&self) -> bool {
        !matches!(self, MessageKind::UserAudio)
    }
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MessageContent {
    UserAudio {
        /// Where the recorded audio can be fetched from (object URL, storage key)
        reference: String,
        duration_secs: f64,
        transcription: Option<String>,
    },
    AiTranscription { text: String },
    AiAnalysis { text: String },
    AiReply { text: String },
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::UserAudio { .. } => MessageKind::UserAudio,
            MessageContent::AiTranscription { .. } => MessageKind::AiTranscription,
            MessageContent::AiAnalysis { .. } => MessageKind::AiAnalysis,
            MessageContent::AiReply { .. } => MessageKind::AiReply,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Completed => "completed",
            MessageStatus::Error => "error",
        }
    }

    /// Completed and errored messages are immutable
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "completed" => Ok(MessageStatus::Completed),
            "error" => Ok(MessageStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown message status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub owner: OwnerRef,
    pub content: MessageContent,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Correlation handle of the submission this message belongs to.
    /// Always present while `status` is pending.
    pub handle: Option<CorrelationHandle>,
}

impl Message {
    /// Optimistic user-audio entry, pending until a transcription arrives
    pub fn pending_audio(
        owner: OwnerRef,
        handle: CorrelationHandle,
        reference: impl Into<String>,
        duration_secs: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            owner,
            content: MessageContent::UserAudio {
                reference: reference.into(),
                duration_secs,
                transcription: None,
            },
            status: MessageStatus::Pending,
            created_at,
            handle: Some(handle),
        }
    }

    /// Completed AI entry correlated to a submission
    pub fn ai(
        owner: OwnerRef,
        handle: CorrelationHandle,
        content: MessageContent,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            owner,
            content,
            status: MessageStatus::Completed,
            created_at,
            handle: Some(handle),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    pub fn transcription(&self) -> Option<&str> {
        match &self.content {
            MessageContent::UserAudio { transcription, .. } => transcription.as_deref(),
            MessageContent::AiTranscription { text } => Some(text),
            _ => None,
        }
    }

    /// Text shown in the bubble for AI kinds
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::UserAudio { .. } => None,
            MessageContent::AiTranscription { text }
            | MessageContent::AiAnalysis { text }
            | MessageContent::AiReply { text } => Some(text),
        }
    }

    /// Check the pending-implies-handle invariant
    pub fn validate(&self) -> Result<()> {
        if self.is_pending() && self.handle.is_none() {
            return Err(Error::InvalidInput(format!(
                "Pending message {} has no correlation handle",
                self.id
            )));
        }
        Ok(())
    }
}
