//! Shared fixtures for stream manager tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::event::EngineEvent;
use crate::engine::provider::{
    Attachment, ProviderError, ProviderSession, SessionOptions, SessionProvider,
};
use crate::persistence::MemoryStore;
use crate::stream::{StreamManager, StreamMessage};

#[derive(Default)]
struct MockState {
    created: u64,
    senders: HashMap<String, mpsc::UnboundedSender<EngineEvent>>,
    options: Vec<SessionOptions>,
    sent: Vec<(String, String)>,
    aborted: Vec<String>,
    fail_create: bool,
    fail_send: bool,
    shut_down: bool,
}

/// Scripted provider: tests push engine events with [`MockProvider::emit`].
#[derive(Default)]
pub(crate) struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn emit(&self, session_id: &str, event: EngineEvent) {
        let state = self.state.lock().unwrap();
        let sender = state
            .senders
            .get(session_id)
            .unwrap_or_else(|| panic!("no session {session_id}"));
        sender.send(event).unwrap();
    }

    pub(crate) fn emit_all(&self, session_id: &str, events: Vec<EngineEvent>) {
        for event in events {
            self.emit(session_id, event);
        }
    }

    pub(crate) fn created(&self) -> u64 {
        self.state.lock().unwrap().created
    }

    pub(crate) fn last_options(&self) -> SessionOptions {
        self.state
            .lock()
            .unwrap()
            .options
            .last()
            .cloned()
            .expect("no session created")
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }

    pub(crate) fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub(crate) fn set_fail_send(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }
}

#[async_trait]
impl SessionProvider for MockProvider {
    async fn get_or_create_session(
        &self,
        options: SessionOptions,
    ) -> Result<ProviderSession, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(ProviderError::Create("mock refused".to_string()));
        }

        state.created += 1;
        let session_id = options
            .resume_session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", state.created));
        let (tx, rx) = mpsc::unbounded_channel();
        state.senders.insert(session_id.clone(), tx);
        state.options.push(options);

        Ok(ProviderSession {
            session_id,
            events: rx,
        })
    }

    async fn send_message(
        &self,
        session_id: &str,
        prompt: &str,
        _attachments: &[Attachment],
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send {
            return Err(ProviderError::Send("mock refused".to_string()));
        }
        state.sent.push((session_id.to_string(), prompt.to_string()));
        Ok(())
    }

    async fn abort_message(&self, session_id: &str) -> Result<(), ProviderError> {
        self.state
            .lock()
            .unwrap()
            .aborted
            .push(session_id.to_string());
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.lock().unwrap().shut_down = true;
    }
}

pub(crate) struct Harness {
    pub provider: Arc<MockProvider>,
    pub store: Arc<MemoryStore>,
    pub manager: StreamManager,
}

pub(crate) fn harness() -> Harness {
    harness_with(|builder| builder)
}

pub(crate) fn harness_with(
    configure: impl FnOnce(crate::StreamManagerBuilder) -> crate::StreamManagerBuilder,
) -> Harness {
    let provider = MockProvider::new();
    let store = Arc::new(MemoryStore::new());
    let manager = configure(StreamManager::builder(provider.clone(), store.clone())).build();
    Harness {
        provider,
        store,
        manager,
    }
}

/// Yield to spawned tasks until `condition` holds.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not met");
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<StreamMessage>) -> Vec<StreamMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}
