//! Test Helper Utilities
//!
//! In-process fakes for the collaborators a session runs against, plus a
//! harness that opens a session over them.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::events::EventBus;
use parley_common::wire::{ClientFrame, ServerFrame};
use parley_common::{
    AnonymousId, CorrelationHandle, InsertFeed, MemoryStore, MergeOutcome, MergeRecord, Message,
    MessageContent, MessageStore, OwnerFilter, OwnerRef, UserId,
};
use parley_session::{
    AudioSubmission, AuthClient, AuthEvent, AuthSession, LocalStorage, MemoryStorage,
    MessageView, Session, SessionConfig, SessionDeps, SessionError, SessionHandle,
    StorageError, Transport, TransportError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};

/// MemoryStore whose merges can be made to fail or to wait
pub struct TestStore {
    pub inner: MemoryStore,
    pub fail_merges: AtomicBool,
    merge_gate: Option<Arc<Semaphore>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_merges: AtomicBool::new(false),
            merge_gate: None,
        }
    }

    /// Store whose merges block until a permit is added to the returned gate
    pub fn gated(bus: EventBus) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Self {
            inner: MemoryStore::with_bus(bus),
            fail_merges: AtomicBool::new(false),
            merge_gate: Some(gate.clone()),
        };
        (store, gate)
    }
}

#[async_trait]
impl MessageStore for TestStore {
    async fn select(&self, filter: &OwnerFilter) -> parley_common::Result<Vec<Message>> {
        self.inner.select(filter).await
    }

    async fn subscribe(&self, filter: OwnerFilter) -> parley_common::Result<InsertFeed> {
        self.inner.subscribe(filter).await
    }

    async fn insert(&self, message: Message) -> parley_common::Result<()> {
        self.inner.insert(message).await
    }
    async fn find_merge(
        &self,
        anonymous_id: &AnonymousId,
    ) -> parley_common::Result<Option<MergeRecord>> {
        self.inner.find_merge(anonymous_id).await
    }

    async fn reassign_ownership(
        &self,
        anonymous_id: &AnonymousId,
        user_id: &UserId,
    ) -> parley_common::Result<MergeOutcome> {
        if let Some(gate) = &self.merge_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(parley_common::Error::Unavailable("merge backend down".into()));
        }
        self.inner.reassign_ownership(anonymous_id, user_id).await
    }
}

/// Records submitted frames; can be switched offline
pub struct FakeTransport {
    online: AtomicBool,
    sent: mpsc::UnboundedSender<ClientFrame>,
}

impl FakeTransport {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn submit(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.send(frame).map_err(|_| TransportError::Closed)
    }
}

pub type OAuthCall = (String, String, Vec<(String, String)>);

pub struct FakeAuth {
    session: Mutex<Option<AuthSession>>,
    events: broadcast::Sender<AuthEvent>,
    pub oauth_calls: Mutex<Vec<OAuthCall>>,
}

impl FakeAuth {
    pub fn new(session: Option<AuthSession>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            session: Mutex::new(session),
            events,
            oauth_calls: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the provider completing a sign-in
    pub fn complete_sign_in(&self, user_id: &str) {
        let session = AuthSession {
            user_id: user(user_id),
            email: None,
        };
        *self.session.lock().unwrap() = Some(session.clone());
        let _ = self.events.send(AuthEvent::SignedIn(session));
    }
}

#[async_trait]
impl AuthClient for FakeAuth {
    async fn get_session(&self) -> parley_session::Result<Option<AuthSession>> {
        Ok(self.session.lock().unwrap().clone())
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_target: &str,
        extra_params: &[(String, String)],
    ) -> parley_session::Result<()> {
        self.oauth_calls.lock().unwrap().push((
            provider.to_string(),
            redirect_target.to_string(),
            extra_params.to_vec(),
        ));
        Ok(())
    }

    async fn sign_out(&self) -> parley_session::Result<()> {
        *self.session.lock().unwrap() = None;
        let _ = self.events.send(AuthEvent::SignedOut);
        Ok(())
    }
}

/// Storage that fails every call
pub struct BrokenStorage;

impl LocalStorage for BrokenStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable("profile locked".into()))
    }
    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("profile locked".into()))
    }
    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("profile locked".into()))
    }
}

pub struct Harness {
    pub store: Arc<TestStore>,
    pub transport: Arc<FakeTransport>,
    pub auth: Arc<FakeAuth>,
    pub storage: Arc<dyn LocalStorage>,
    pub results: mpsc::Sender<ServerFrame>,
    pub sent: mpsc::UnboundedReceiver<ClientFrame>,
    pub session: SessionHandle,
}

pub struct HarnessBuilder {
    store: Arc<TestStore>,
    auth: Arc<FakeAuth>,
    storage: Arc<dyn LocalStorage>,
    config: SessionConfig,
}

impl HarnessBuilder {
    pub fn store(mut self, store: Arc<TestStore>) -> Self {
        self.store = store;
        self
    }

    pub fn auth(mut self, auth: Arc<FakeAuth>) -> Self {
        self.auth = auth;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn LocalStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn open(self) -> Harness {
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (results, results_rx) = mpsc::channel(64);
        let transport = Arc::new(FakeTransport {
            online: AtomicBool::new(true),
            sent: sent_tx,
        });

        let session = Session::open(
            SessionDeps {
                store: self.store.clone(),
                transport: transport.clone(),
                results: results_rx,
                auth: self.auth.clone(),
                storage: self.storage.clone(),
            },
            self.config,
        )
        .await
        .unwrap();

        Harness {
            store: self.store,
            transport,
            auth: self.auth,
            storage: self.storage,
            results,
            sent,
            session,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            store: Arc::new(TestStore::new()),
            auth: Arc::new(FakeAuth::new(None)),
            storage: Arc::new(MemoryStorage::new()),
            config: fast_config(),
        }
    }

    pub async fn open() -> Self {
        Self::builder().open().await
    }

    /// Handle of the next frame the session sent
    pub async fn next_handle(&mut self) -> CorrelationHandle {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("no frame sent")
            .expect("transport dropped");
        match frame {
            ClientFrame::Audio { handle, .. } => handle,
        }
    }

    pub async fn deliver(&self, frame: ServerFrame) {
        self.results.send(frame).await.unwrap();
    }

    pub async fn anonymous_id(&self) -> AnonymousId {
        self.session.identity().await.unwrap().anonymous_id
    }

    /// Wait until the view satisfies `pred`
    pub async fn wait_for(&self, what: &str, pred: impl Fn(&[Message]) -> bool) -> MessageView {
        let mut view = self.session.view();
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = view.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                if view.changed().await.is_err() {
                    return current;
                }
            }
        })
        .await;
        match waited {
            Ok(current) if pred(&current) => current,
            _ => panic!("timed out waiting for {}", what),
        }
    }
}

/// Short timers so retry paths run quickly
pub fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.merge_retry.max_attempts = 1;
    config.merge_retry_interval = Duration::from_millis(50);
    config.resubscribe_backoff = Duration::from_millis(20);
    config.sweep_interval = Duration::from_millis(100);
    config
}

pub fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

pub fn audio(n: usize) -> AudioSubmission {
    AudioSubmission {
        payload: "data:audio/wav;base64,UklGRg==".to_string(),
        reference: format!("blob:recording-{}", n),
        duration_secs: 1.5,
    }
}

pub fn reply_row(owner: OwnerRef, text: &str, at: DateTime<Utc>) -> Message {
    Message::ai(
        owner,
        CorrelationHandle::generate(),
        MessageContent::AiReply { text: text.into() },
        at,
    )
}

pub fn texts(view: &[Message]) -> Vec<String> {
    view.iter()
        .map(|m| m.text().or(m.transcription()).unwrap_or("<audio>").to_string())
        .collect()
}

pub fn is_closed(err: &SessionError) -> bool {
    matches!(err, SessionError::SessionClosed)
}
