//! Correlates audio submissions with their out-of-band results
//!
//! Each submission gets a fresh [`CorrelationHandle`]. Transcription,
//! analysis and reply arrive separately and in any order; the tracker
//! patches the submission's user message and adds one AI message per
//! result kind, so a repeated result never produces a second bubble.

use chrono::{DateTime, Utc};
use parley_common::wire::ClientFrame;
use parley_common::{
    CorrelationHandle, Message, MessageContent, MessageId, MessageKind, MessageStatus, OwnerRef,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::message_log::MessageLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Submitted,
    Transcribing,
    Transcribed,
    /// Analysis shown, reply outstanding
    Replying,
    Completed,
    Error,
}

/// Recorded audio as handed over by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSubmission {
    /// Base64 audio, optionally as a `data:` URL
    pub payload: String,
    /// Where the recording can be played back from
    pub reference: String,
    pub duration_secs: f64,
}

/// Optimistic message plus the frame to send for it
#[derive(Debug, Clone)]
pub struct Submitted {
    pub handle: CorrelationHandle,
    pub message: Message,
    pub frame: ClientFrame,
}

/// How long an errored request stays retryable
const ERROR_RETENTION: Duration = Duration::from_secs(30 * 60);
/// Errored requests kept at most; the oldest go first
const MAX_RETAINED_ERRORS: usize = 32;

#[derive(Debug)]
struct PendingRequest {
    owner: OwnerRef,
    stage: Stage,
    /// Result deadline, or end of retention once errored
    deadline: Instant,
    /// Kept until a transcription arrives so an errored request can be retried
    submission: Option<AudioSubmission>,
    transcribed: bool,
    /// Analysis that arrived before the transcription
    buffered_analysis: Option<String>,
    analysis_shown: bool,
    reply_shown: bool,
}

impl PendingRequest {
    fn mark_errored(&mut self) {
        self.stage = Stage::Error;
        self.deadline = Instant::now() + ERROR_RETENTION;
    }
}

pub struct PendingRequestTracker {
    requests: HashMap<CorrelationHandle, PendingRequest>,
    timeout: Duration,
}

impl PendingRequestTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            timeout,
        }
    }

    pub fn stage(&self, handle: &CorrelationHandle) -> Option<Stage> {
        self.requests.get(handle).map(|r| r.stage)
    }

    /// Number of requests still awaiting some result
    pub fn in_flight(&self) -> usize {
        self.requests
            .values()
            .filter(|r| !matches!(r.stage, Stage::Completed | Stage::Error))
            .count()
    }

    /// Add a pending user message and start tracking a fresh handle
    pub fn submit(
        &mut self,
        log: &mut MessageLog,
        owner: OwnerRef,
        submission: AudioSubmission,
        now: DateTime<Utc>,
    ) -> Result<Submitted> {
        let handle = CorrelationHandle::generate();
        let message = Message::pending_audio(
            owner.clone(),
            handle,
            submission.reference.clone(),
            submission.duration_secs,
            now,
        );
        log.insert_local(message.clone())?;

        let frame = ClientFrame::Audio {
            handle,
            payload: submission.payload.clone(),
            owner: owner.clone(),
            duration: submission.duration_secs,
            reference: Some(submission.reference.clone()),
        };

        self.requests.insert(
            handle,
            PendingRequest {
                owner,
                stage: Stage::Submitted,
                deadline: Instant::now() + self.timeout,
                submission: Some(submission),
                transcribed: false,
                buffered_analysis: None,
                analysis_shown: false,
                reply_shown: false,
            },
        );
        debug!(%handle, message_id = %message.id, "Tracking submission");

        Ok(Submitted {
            handle,
            message,
            frame,
        })
    }

    /// Transport accepted the frame
    pub fn on_sent(&mut self, handle: &CorrelationHandle) {
        if let Some(request) = self.requests.get_mut(handle) {
            if request.stage == Stage::Submitted {
                request.stage = Stage::Transcribing;
            }
        }
    }

    /// Transport rejected the frame; returns the errored message
    pub fn on_submit_failed(
        &mut self,
        log: &mut MessageLog,
        handle: &CorrelationHandle,
        reason: &str,
    ) -> Option<MessageId> {
        let request = self.requests.get_mut(handle)?;
        if request.stage != Stage::Submitted {
            return None;
        }
        warn!(%handle, "Submission failed: {}", reason);
        request.mark_errored();
        log.patch_pending(handle, MessageKind::UserAudio, |m| {
            m.status = MessageStatus::Error;
        })
    }

    pub fn on_transcription(
        &mut self,
        log: &mut MessageLog,
        handle: &CorrelationHandle,
        text: String,
        analysis: Option<String>,
    ) -> Result<()> {
        let request = self.live_request(handle)?;
        if request.transcribed {
            debug!(%handle, "Duplicate transcription ignored");
            return Ok(());
        }

        log.patch_pending(handle, MessageKind::UserAudio, |m| {
            if let MessageContent::UserAudio { transcription, .. } = &mut m.content {
                *transcription = Some(text);
            }
            m.status = MessageStatus::Completed;
        });

        request.transcribed = true;
        request.submission = None;
        request.stage = Stage::Transcribed;
        if analysis.is_some() {
            request.buffered_analysis = analysis;
        }

        Self::show_analysis(log, handle, request);
        Self::advance(handle, request);
        Ok(())
    }

    pub fn on_analysis(
        &mut self,
        log: &mut MessageLog,
        handle: &CorrelationHandle,
        text: String,
    ) -> Result<()> {
        let request = self.live_request(handle)?;
        if request.analysis_shown || request.buffered_analysis.is_some() {
            debug!(%handle, "Duplicate analysis ignored");
            return Ok(());
        }
        request.buffered_analysis = Some(text);
        Self::show_analysis(log, handle, request);
        Self::advance(handle, request);
        Ok(())
    }

    pub fn on_reply(
        &mut self,
        log: &mut MessageLog,
        handle: &CorrelationHandle,
        text: String,
    ) -> Result<()> {
        let request = self.live_request(handle)?;
        if request.reply_shown {
            debug!(%handle, "Duplicate reply ignored");
            return Ok(());
        }

        // the stored row may already have come in over the live feed
        if log.find(handle, MessageKind::AiReply).is_none() {
            let reply = Message::ai(
                request.owner.clone(),
                *handle,
                MessageContent::AiReply { text },
                Utc::now(),
            );
            log.insert_local(reply)?;
        }
        request.reply_shown = true;
        Self::advance(handle, request);
        Ok(())
    }

    /// Backend reported a failure for this submission
    pub fn on_error(
        &mut self,
        log: &mut MessageLog,
        handle: &CorrelationHandle,
        reason: &str,
    ) -> Result<Option<MessageId>> {
        let request = self.live_request(handle)?;
        warn!(%handle, stage = ?request.stage, "Backend error: {}", reason);
        if !request.transcribed {
            request.mark_errored();
        } else {
            // user message already completed; nothing left to show
            self.requests.remove(handle);
            return Ok(None);
        }

        Ok(log.patch_pending(handle, MessageKind::UserAudio, |m| {
            m.status = MessageStatus::Error;
        }))
    }

    /// Expire requests past their deadline
    ///
    /// A request still waiting for its transcription errors its message and
    /// stays retryable; the ids of those messages are returned. Requests
    /// past transcription are dropped quietly, as are errored requests past
    /// their retention or beyond the retained count.
    pub fn sweep_expired(&mut self, log: &mut MessageLog, now: Instant) -> Vec<MessageId> {
        let expired: Vec<CorrelationHandle> = self
            .requests
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(h, _)| *h)
            .collect();

        let mut timed_out = Vec::new();
        for handle in expired {
            let Some(request) = self.requests.get_mut(&handle) else {
                continue;
            };
            match request.stage {
                Stage::Submitted | Stage::Transcribing => {
                    request.mark_errored();
                    if let Some(id) = log.patch_pending(&handle, MessageKind::UserAudio, |m| {
                        m.status = MessageStatus::Error;
                    }) {
                        info!(%handle, message_id = %id, "Submission timed out");
                        timed_out.push(id);
                    }
                }
                Stage::Transcribed | Stage::Replying => {
                    warn!(%handle, "No reply before deadline, dropping request");
                    self.requests.remove(&handle);
                }
                Stage::Completed => {
                    self.requests.remove(&handle);
                }
                Stage::Error => {
                    debug!(%handle, "Errored request no longer retryable");
                    self.requests.remove(&handle);
                }
            }
        }

        self.evict_excess_errors();
        timed_out
    }

    fn evict_excess_errors(&mut self) {
        let mut errored: Vec<(Instant, CorrelationHandle)> = self
            .requests
            .iter()
            .filter(|(_, r)| r.stage == Stage::Error)
            .map(|(h, r)| (r.deadline, *h))
            .collect();
        if errored.len() <= MAX_RETAINED_ERRORS {
            return;
        }
        errored.sort();
        let excess = errored.len() - MAX_RETAINED_ERRORS;
        for (_, handle) in errored.into_iter().take(excess) {
            self.requests.remove(&handle);
        }
        info!("Evicted {} errored requests", excess);
    }

    /// A stored row settled this submission; stop offering it for retry
    ///
    /// Returns true when an errored request was dropped.
    pub fn on_confirmed(&mut self, message: &Message) -> bool {
        let Some(handle) = message.handle else {
            return false;
        };
        if message.kind() != MessageKind::UserAudio || message.status == MessageStatus::Error {
            return false;
        }
        match self.requests.get(&handle) {
            Some(r) if r.stage == Stage::Error => {
                debug!(%handle, "Errored submission confirmed by the store");
                self.requests.remove(&handle);
                true
            }
            _ => false,
        }
    }

    /// Resubmit an errored message under a fresh handle
    ///
    /// The errored entry is removed from the log and replaced by a new
    /// pending one.
    pub fn retry(
        &mut self,
        log: &mut MessageLog,
        message_id: &MessageId,
        owner: OwnerRef,
        now: DateTime<Utc>,
    ) -> Result<Submitted> {
        let message = log
            .get(message_id)
            .ok_or(SessionError::UnknownMessage(*message_id))?;
        if message.status != MessageStatus::Error || message.kind() != MessageKind::UserAudio {
            return Err(SessionError::NotRetryable(*message_id));
        }
        let stale = message.handle.ok_or(SessionError::NotRetryable(*message_id))?;

        let submission = match self.requests.get(&stale) {
            Some(r) if r.stage == Stage::Error => r.submission.clone(),
            _ => None,
        }
        .ok_or(SessionError::NotRetryable(*message_id))?;

        self.requests.remove(&stale);
        log.remove(message_id);
        info!(stale = %stale, "Retrying submission");
        self.submit(log, owner, submission, now)
    }

    /// Forget every handle; results arriving later are discarded
    pub fn abandon_all(&mut self) -> usize {
        let count = self.requests.len();
        self.requests.clear();
        if count > 0 {
            info!("Abandoned {} pending requests", count);
        }
        count
    }

    fn live_request(&mut self, handle: &CorrelationHandle) -> Result<&mut PendingRequest> {
        match self.requests.get_mut(handle) {
            Some(request) if request.stage != Stage::Error => Ok(request),
            _ => Err(SessionError::ResultCorrelationMiss(*handle)),
        }
    }

    // Analysis is shown only once the transcription it explains is in
    fn show_analysis(log: &mut MessageLog, handle: &CorrelationHandle, request: &mut PendingRequest) {
        if !request.transcribed || request.analysis_shown {
            return;
        }
        let Some(text) = request.buffered_analysis.take() else {
            return;
        };
        if log.find(handle, MessageKind::AiAnalysis).is_none() {
            let analysis = Message::ai(
                request.owner.clone(),
                *handle,
                MessageContent::AiAnalysis { text },
                Utc::now(),
            );
            if let Err(e) = log.insert_local(analysis) {
                warn!(%handle, "Failed to add analysis: {}", e);
                return;
            }
        }
        request.analysis_shown = true;
        if request.stage == Stage::Transcribed {
            request.stage = Stage::Replying;
        }
    }

    fn advance(handle: &CorrelationHandle, request: &mut PendingRequest) {
        if request.transcribed && request.reply_shown && request.stage != Stage::Completed {
            request.stage = Stage::Completed;
            debug!(%handle, "Request completed");
        }
    }
}
