//! Session composition root
//!
//! [`Session::open`] wires the identity, quota, merge, log and tracker
//! components together and spawns one reconciliation task. Every mutation
//! of the message log and identity happens on that task, fed by:
//! - commands from [`SessionHandle`]
//! - results from the transport
//! - auth state changes
//! - inserts from the live feed
//! - completions of background merge and resubscribe work
//! - a periodic timeout sweep
//!
//! Callers observe the ordered view through a `watch` channel and
//! out-of-band conditions through [`SessionNotice`]s.

use chrono::Utc;
use parley_common::wire::ServerFrame;
use parley_common::{
    AnonymousId, FeedError, InsertFeed, Message, MessageId, MessageStore, UserId,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::{AuthClient, AuthEvent, TEMP_USER_ID_PARAM};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::identity::{Identity, IdentityStore, Persistence};
use crate::merge::MergeCoordinator;
use crate::message_log::{self, MessageLog};
use crate::pending::{AudioSubmission, PendingRequestTracker, Submitted};
use crate::quota::{QuotaGate, QuotaStatus, Remaining};
use crate::storage::LocalStorage;
use crate::transport::Transport;

const NOTICE_CAPACITY: usize = 64;

/// Ordered, merged message view
pub type MessageView = Arc<Vec<Message>>;

/// External collaborators a session runs against
pub struct SessionDeps {
    pub store: Arc<dyn MessageStore>,
    pub transport: Arc<dyn Transport>,
    /// Results coming back from the transport
    pub results: mpsc::Receiver<ServerFrame>,
    pub auth: Arc<dyn AuthClient>,
    pub storage: Arc<dyn LocalStorage>,
}

/// Conditions worth telling the user about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SessionNotice {
    /// Last free anonymous submission was just used
    AuthPromptRequired,
    SubmitFailed {
        message_id: MessageId,
        reason: String,
    },
    RequestTimedOut {
        message_id: MessageId,
    },
    /// History will not survive a restart
    PersistenceDegraded {
        reason: String,
    },
    /// Anonymous history is still shown under its own token; a retry is scheduled
    MergeFailed {
        anonymous_id: AnonymousId,
        reason: String,
    },
    SubscriptionUnstable {
        failures: u32,
    },
}

#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    /// Optimistic message as it now stands in the view
    pub message: Message,
    pub quota: QuotaStatus,
}

enum Command {
    Submit {
        submission: AudioSubmission,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
    Retry {
        message_id: MessageId,
        reply: oneshot::Sender<Result<Message>>,
    },
    Auth {
        event: AuthEvent,
        reply: oneshot::Sender<()>,
    },
    Identity {
        reply: oneshot::Sender<Identity>,
    },
    Remaining {
        reply: oneshot::Sender<Remaining>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Completions of work spawned off the loop
enum Internal {
    Resynced {
        generation: u64,
        feed: InsertFeed,
        rows: Vec<Message>,
        unmerged: Option<AnonymousId>,
    },
    ResyncFailed {
        generation: u64,
        reason: String,
    },
    ResyncDue {
        generation: u64,
    },
    MergeFailed {
        epoch: u64,
        anonymous_id: AnonymousId,
        user_id: UserId,
        reason: String,
    },
    MergeRecovered {
        epoch: u64,
        anonymous_id: AnonymousId,
    },
    /// Sign-in merge finished, one way or the other
    MergeSettled {
        epoch: u64,
        generation: u64,
        anonymous_id: AnonymousId,
        merged: bool,
    },
}

enum LoopEvent {
    Command(Command),
    Shutdown,
    Result(Option<ServerFrame>),
    Auth(std::result::Result<AuthEvent, broadcast::error::RecvError>),
    Insert(std::result::Result<Message, FeedError>),
    Internal(Internal),
    Sweep,
}

pub struct Session;

impl Session {
    /// Restore identity, merge if already signed in, load history, and
    /// start the reconciliation task
    pub async fn open(deps: SessionDeps, config: SessionConfig) -> Result<SessionHandle> {
        let SessionDeps {
            store,
            transport,
            results,
            auth,
            storage,
        } = deps;

        let identity = IdentityStore::load(storage.clone());
        let persistence = identity.persistence();
        let quota = QuotaGate::new(storage, config.anonymous_quota);
        let merger = Arc::new(MergeCoordinator::new(store.clone(), config.merge_retry));

        // Subscribe before reading the session so no transition is missed
        let auth_events = auth.on_auth_state_change();

        let (view_tx, view_rx) = watch::channel(Arc::new(Vec::new()));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));

        let mut reconciler = Reconciler {
            tracker: PendingRequestTracker::new(config.pending_timeout),
            identity,
            quota,
            merger,
            store,
            transport,
            auth: auth.clone(),
            log: MessageLog::new(),
            feed: None,
            generation: 0,
            epoch: 0,
            unmerged: None,
            merging: None,
            resync_failures: 0,
            view_tx,
            notices: notices.clone(),
            internal_tx,
            config,
        };
        reconciler.restore().await;

        tokio::spawn(reconciler.run(command_rx, results, auth_events, internal_rx));

        Ok(SessionHandle {
            commands: command_tx,
            view: view_rx,
            notices,
            auth,
            persistence,
        })
    }
}

/// Cloneable front end to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<MessageView>,
    notices: broadcast::Sender<SessionNotice>,
    auth: Arc<dyn AuthClient>,
    persistence: Persistence,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Add an optimistic message and send the audio
    ///
    /// Returns as soon as the message is in the view. Transport rejection
    /// shows up as an errored message plus a `SubmitFailed` notice, not as
    /// an `Err`.
    pub async fn submit_audio(&self, submission: AudioSubmission) -> Result<SubmitReceipt> {
        self.request(|reply| Command::Submit { submission, reply })
            .await?
    }

    /// Resubmit an errored message under a fresh handle
    pub async fn retry(&self, message_id: MessageId) -> Result<Message> {
        self.request(|reply| Command::Retry { message_id, reply })
            .await?
    }

    /// Push an auth transition observed outside the auth client's stream
    pub async fn auth_changed(&self, event: AuthEvent) -> Result<()> {
        self.request(|reply| Command::Auth { event, reply }).await
    }

    /// Start provider sign-in, carrying the anonymous token to the callback
    pub async fn sign_in_with_oauth(&self, provider: &str, redirect_target: &str) -> Result<()> {
        let identity = self.identity().await?;
        let params = vec![(
            TEMP_USER_ID_PARAM.to_string(),
            identity.anonymous_id.to_string(),
        )];
        self.auth
            .sign_in_with_oauth(provider, redirect_target, &params)
            .await
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.auth.sign_out().await?;
        self.auth_changed(AuthEvent::SignedOut).await
    }

    pub async fn identity(&self) -> Result<Identity> {
        self.request(|reply| Command::Identity { reply }).await
    }

    pub async fn remaining(&self) -> Result<Remaining> {
        self.request(|reply| Command::Remaining { reply }).await
    }

    pub fn view(&self) -> watch::Receiver<MessageView> {
        self.view.clone()
    }

    /// Current view without waiting
    pub fn messages(&self) -> MessageView {
        self.view.borrow().clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// Stop the session; pending results are abandoned
    pub async fn close(&self) -> Result<()> {
        match self.request(|reply| Command::Close { reply }).await {
            Ok(()) | Err(SessionError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// State owned by the reconciliation task
struct Reconciler {
    identity: IdentityStore,
    quota: QuotaGate,
    log: MessageLog,
    tracker: PendingRequestTracker,
    merger: Arc<MergeCoordinator>,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthClient>,
    feed: Option<InsertFeed>,
    /// Bumped on every resync; stale completions are dropped
    generation: u64,
    /// Bumped on every identity change
    epoch: u64,
    /// Anonymous token whose merge has not succeeded yet
    unmerged: Option<AnonymousId>,
    /// Anonymous token whose sign-in merge is still running
    merging: Option<AnonymousId>,
    resync_failures: u32,
    view_tx: watch::Sender<MessageView>,
    notices: broadcast::Sender<SessionNotice>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    config: SessionConfig,
}

async fn next_insert(feed: &mut Option<InsertFeed>) -> std::result::Result<Message, FeedError> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

impl Reconciler {
    async fn restore(&mut self) {
        if let Some(reason) = self.identity.degraded_reason() {
            self.notify(SessionNotice::PersistenceDegraded {
                reason: reason.to_string(),
            });
        }

        let mut merge = None;
        match self.auth.get_session().await {
            Ok(Some(session)) => {
                let anonymous_id = self.identity.ensure_anonymous_id();
                if self.identity.on_authenticated(session.user_id.clone()) {
                    merge = Some((anonymous_id, session.user_id));
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read auth session, starting anonymous: {}", e),
        }

        if let Some((anonymous_id, user_id)) = merge {
            if let Err(e) = self
                .merger
                .merge_with_retry(Some(&anonymous_id), &user_id)
                .await
            {
                self.on_merge_failed(anonymous_id, user_id, e.to_string());
            }
        }

        let identity = self.identity.current_identity();
        let filter = identity.visible_filter(self.unmerged.as_ref());
        match message_log::resync(self.store.as_ref(), filter).await {
            Ok((feed, rows)) => {
                info!(
                    owner = %identity.owner(),
                    rows = rows.len(),
                    "Session history loaded"
                );
                self.log.load_snapshot(rows);
                self.feed = Some(feed);
                self.publish();
            }
            Err(e) => self.on_resync_failed(e.to_string()),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut results: mpsc::Receiver<ServerFrame>,
        mut auth_events: broadcast::Receiver<AuthEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut results_open = true;
        let mut auth_open = true;

        loop {
            let event = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => LoopEvent::Command(cmd),
                    None => LoopEvent::Shutdown,
                },
                frame = results.recv(), if results_open => LoopEvent::Result(frame),
                auth = auth_events.recv(), if auth_open => LoopEvent::Auth(auth),
                inserted = next_insert(&mut self.feed) => LoopEvent::Insert(inserted),
                Some(internal) = internal_rx.recv() => LoopEvent::Internal(internal),
                _ = sweep.tick() => LoopEvent::Sweep,
            };

            match event {
                LoopEvent::Command(Command::Close { reply }) => {
                    self.teardown();
                    let _ = reply.send(());
                    break;
                }
                LoopEvent::Command(cmd) => self.handle_command(cmd).await,
                LoopEvent::Shutdown => {
                    self.teardown();
                    break;
                }
                LoopEvent::Result(Some(frame)) => self.handle_result(frame),
                LoopEvent::Result(None) => {
                    warn!("Transport result stream ended");
                    results_open = false;
                }
                LoopEvent::Auth(Ok(event)) => self.handle_auth(event),
                LoopEvent::Auth(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("Missed {} auth events", skipped);
                }
                LoopEvent::Auth(Err(broadcast::error::RecvError::Closed)) => {
                    debug!("Auth event stream closed");
                    auth_open = false;
                }
                LoopEvent::Insert(Ok(message)) => {
                    self.tracker.on_confirmed(&message);
                    self.log.apply_confirmed(message);
                    self.publish();
                }
                LoopEvent::Insert(Err(e)) => {
                    warn!("{}", SessionError::SubscriptionLost(e.to_string()));
                    self.feed = None;
                    self.start_resync(None);
                }
                LoopEvent::Internal(internal) => self.handle_internal(internal),
                LoopEvent::Sweep => self.sweep(),
            }
        }

        info!("Session closed");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { submission, reply } => {
                let _ = reply.send(self.submit(submission).await);
            }
            Command::Retry { message_id, reply } => {
                let _ = reply.send(self.retry(message_id).await);
            }
            Command::Auth { event, reply } => {
                self.handle_auth(event);
                let _ = reply.send(());
            }
            Command::Identity { reply } => {
                let _ = reply.send(self.identity.current_identity());
            }
            Command::Remaining { reply } => {
                let _ = reply.send(self.quota.remaining(&self.identity.current_identity()));
            }
            // handled by the loop
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn submit(&mut self, submission: AudioSubmission) -> Result<SubmitReceipt> {
        let identity = self.identity.current_identity();
        let submitted =
            self.tracker
                .submit(&mut self.log, identity.owner(), submission, Utc::now())?;

        let quota = self.quota.record_submission(&identity);
        if quota.prompt_auth {
            info!("Anonymous quota exhausted, prompting for sign-in");
            self.notify(SessionNotice::AuthPromptRequired);
        }

        let message = self.send(submitted).await;
        self.publish();
        Ok(SubmitReceipt { message, quota })
    }

    async fn retry(&mut self, message_id: MessageId) -> Result<Message> {
        let owner = self.identity.current_identity().owner();
        let submitted = self
            .tracker
            .retry(&mut self.log, &message_id, owner, Utc::now())?;
        let message = self.send(submitted).await;
        self.publish();
        Ok(message)
    }

    /// Hand a frame to the transport and return the message as it now stands
    async fn send(&mut self, submitted: Submitted) -> Message {
        let Submitted {
            handle,
            message,
            frame,
        } = submitted;

        match self.transport.submit(frame).await {
            Ok(()) => self.tracker.on_sent(&handle),
            Err(e) => {
                let reason = SessionError::TransportSubmitFailed(e.to_string()).to_string();
                if let Some(message_id) =
                    self.tracker
                        .on_submit_failed(&mut self.log, &handle, &reason)
                {
                    self.notify(SessionNotice::SubmitFailed { message_id, reason });
                }
            }
        }

        self.log.get(&message.id).cloned().unwrap_or(message)
    }

    fn handle_result(&mut self, frame: ServerFrame) {
        let handle = frame.handle();
        let frame_type = frame.frame_type();
        let outcome = match frame {
            ServerFrame::Transcription {
                handle,
                text,
                analysis,
            } => self
                .tracker
                .on_transcription(&mut self.log, &handle, text, analysis),
            ServerFrame::Analysis { handle, text } => {
                self.tracker.on_analysis(&mut self.log, &handle, text)
            }
            ServerFrame::AiReply { handle, text } => {
                self.tracker.on_reply(&mut self.log, &handle, text)
            }
            ServerFrame::Error { handle, reason } => self
                .tracker
                .on_error(&mut self.log, &handle, &reason)
                .map(|_| ()),
        };

        match outcome {
            Ok(()) => self.publish(),
            Err(SessionError::ResultCorrelationMiss(_)) => {
                warn!(%handle, frame_type, "Discarding result for unknown or expired handle");
            }
            Err(e) => warn!(%handle, frame_type, "Failed to apply result: {}", e),
        }
    }

    fn handle_auth(&mut self, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) => {
                let current = self.identity.current_identity();
                if current.user_id.as_ref() == Some(&session.user_id) {
                    debug!("Duplicate sign-in event for {}", session.user_id);
                    return;
                }
                if !current.is_anonymous() {
                    // switching accounts goes through a full sign-out first
                    self.sign_out_locally();
                }

                let anonymous_id = self.identity.ensure_anonymous_id();
                self.identity.on_authenticated(session.user_id.clone());
                self.epoch += 1;
                self.unmerged = None;
                self.merging = Some(anonymous_id);
                self.start_resync(Some((anonymous_id, session.user_id)));
            }
            AuthEvent::SignedOut => {
                if self.identity.current_identity().is_anonymous() {
                    debug!("Sign-out while anonymous ignored");
                    return;
                }
                self.sign_out_locally();
                self.start_resync(None);
            }
        }
    }

    fn sign_out_locally(&mut self) {
        self.tracker.abandon_all();
        self.feed = None;
        self.log = MessageLog::new();
        if let Some(identity) = self.identity.on_signed_out() {
            self.quota.reset(identity.anonymous_id);
        }
        self.epoch += 1;
        self.unmerged = None;
        self.merging = None;
        self.publish();
    }

    /// Merge if asked, then subscribe and snapshot for the current identity
    ///
    /// The current feed stays live until the new pair is installed. While a
    /// sign-in merge is still running its anonymous rows stay in the filter.
    fn start_resync(&mut self, merge: Option<(AnonymousId, UserId)>) {
        self.generation += 1;
        let generation = self.generation;
        let epoch = self.epoch;
        let identity = self.identity.current_identity();
        let carried = self.unmerged.or(self.merging);
        let store = self.store.clone();
        let merger = self.merger.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let mut unmerged = carried;
            if let Some((anonymous_id, user_id)) = merge {
                match merger
                    .merge_with_retry(Some(&anonymous_id), &user_id)
                    .await
                {
                    Ok(_) => unmerged = None,
                    Err(e) => {
                        unmerged = Some(anonymous_id);
                        let _ = tx.send(Internal::MergeFailed {
                            epoch,
                            anonymous_id,
                            user_id,
                            reason: e.to_string(),
                        });
                    }
                }
                let _ = tx.send(Internal::MergeSettled {
                    epoch,
                    generation,
                    anonymous_id,
                    merged: unmerged.is_none(),
                });
            }

            let filter = identity.visible_filter(unmerged.as_ref());
            let done = match message_log::resync(store.as_ref(), filter).await {
                Ok((feed, rows)) => Internal::Resynced {
                    generation,
                    feed,
                    rows,
                    unmerged,
                },
                Err(e) => Internal::ResyncFailed {
                    generation,
                    reason: e.to_string(),
                },
            };
            let _ = tx.send(done);
        });
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Resynced {
                generation,
                feed,
                rows,
                unmerged,
            } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Dropping stale resync");
                    return;
                }
                info!(rows = rows.len(), filter = ?feed.filter().owners(), "Resubscribed");
                for row in &rows {
                    self.tracker.on_confirmed(row);
                }
                self.log.load_snapshot(rows);
                self.feed = Some(feed);
                self.unmerged = unmerged;
                self.resync_failures = 0;
                self.publish();
            }
            Internal::ResyncFailed { generation, reason } => {
                if generation == self.generation {
                    self.on_resync_failed(reason);
                }
            }
            Internal::ResyncDue { generation } => {
                if generation == self.generation {
                    self.start_resync(None);
                }
            }
            Internal::MergeFailed {
                epoch,
                anonymous_id,
                user_id,
                reason,
            } => {
                if epoch == self.epoch {
                    self.on_merge_failed(anonymous_id, user_id, reason);
                }
            }
            Internal::MergeRecovered {
                epoch,
                anonymous_id,
            } => {
                if epoch == self.epoch && self.unmerged == Some(anonymous_id) {
                    info!("Deferred merge of {} succeeded", anonymous_id);
                    self.unmerged = None;
                    self.start_resync(None);
                }
            }
            Internal::MergeSettled {
                epoch,
                generation,
                anonymous_id,
                merged,
            } => {
                if epoch != self.epoch || self.merging != Some(anonymous_id) {
                    return;
                }
                self.merging = None;
                if merged && self.unmerged == Some(anonymous_id) {
                    self.unmerged = None;
                }
                // a newer resync snapshotted mid-merge; its rows are out of date
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Merge outlived its resync");
                    self.start_resync(None);
                }
            }
        }
    }

    fn on_merge_failed(&mut self, anonymous_id: AnonymousId, user_id: UserId, reason: String) {
        warn!(
            "{}; keeping anonymous history visible",
            SessionError::MergeFailed {
                anonymous_id,
                user_id: user_id.clone(),
                reason: reason.clone(),
            }
        );
        self.unmerged = Some(anonymous_id);
        self.notify(SessionNotice::MergeFailed {
            anonymous_id,
            reason,
        });

        let epoch = self.epoch;
        let delay = self.config.merge_retry_interval;
        let merger = self.merger.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let done = match merger.merge_with_retry(Some(&anonymous_id), &user_id).await {
                Ok(_) => Internal::MergeRecovered {
                    epoch,
                    anonymous_id,
                },
                Err(e) => Internal::MergeFailed {
                    epoch,
                    anonymous_id,
                    user_id,
                    reason: e.to_string(),
                },
            };
            let _ = tx.send(done);
        });
    }

    fn on_resync_failed(&mut self, reason: String) {
        self.resync_failures += 1;
        warn!(
            failures = self.resync_failures,
            "{}",
            SessionError::SubscriptionLost(reason)
        );
        if self.resync_failures >= self.config.resubscribe_failure_threshold {
            self.notify(SessionNotice::SubscriptionUnstable {
                failures: self.resync_failures,
            });
        }

        let factor = 2u32.saturating_pow(self.resync_failures.saturating_sub(1).min(5));
        let delay = self.config.resubscribe_backoff.saturating_mul(factor);
        let generation = self.generation;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::ResyncDue { generation });
        });
    }

    fn sweep(&mut self) {
        let timed_out = self.tracker.sweep_expired(&mut self.log, Instant::now());
        if timed_out.is_empty() {
            return;
        }
        for message_id in timed_out {
            self.notify(SessionNotice::RequestTimedOut { message_id });
        }
        self.publish();
    }

    fn teardown(&mut self) {
        let abandoned = self.tracker.abandon_all();
        self.feed = None;
        info!(abandoned, "Tearing down session");
    }

    fn publish(&self) {
        self.view_tx.send_replace(Arc::new(self.log.view()));
    }

    fn notify(&self, notice: SessionNotice) {
        debug!(?notice, "Session notice");
        let _ = self.notices.send(notice);
    }
}
