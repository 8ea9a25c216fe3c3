//! StreamManager - the registry of live conversation streams.
//!
//! One manager is built at process start and shared by cloning. It admits new
//! streams, wires each provider session through the accumulator, fans events
//! out to subscribers, and flushes finished turns to the store.
//!
//! All registry state sits behind a single mutex that is never held across
//! an `.await`. Each stream's engine events are drained by one pump task, so
//! a conversation's events are applied in the order the engine sent them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::accumulation::Accumulation;
use super::accumulator::Ingested;
use super::bridge::{PermissionHandler, UserInputBridge};
use super::event::{StreamEvent, StreamMode, StreamStatus};
use super::event_bus::{EventSink, SubscriberId};
use super::pending_input::{
    TimeoutHook, UserInputPrompt, UserInputRequestInfo, UserInputResponse, UserInputResult,
};
use super::state::ConversationStream;
use crate::config::{StreamManagerBuilder, StreamManagerConfig};
use crate::engine::event::EngineEvent;
use crate::engine::provider::{
    Attachment, ProviderError, ProviderSession, SessionOptions, SessionProvider,
};
use crate::logging::{log_line, open_log_file};
use crate::paths::resolve_working_dir;
use crate::persistence::{ConversationPatch, ConversationStore, NewMessage, StoreError};
use crate::plan::{PlanError, PlanWriter};
use crate::quota::{QuotaCache, QuotaInfo};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream manager is shutting down")]
    AlreadyShuttingDown,

    #[error("A stream is already running for conversation {0}")]
    DuplicateStream(String),

    #[error("Too many concurrent streams (limit {0})")]
    ConcurrencyExceeded(usize),

    #[error("Stream for conversation {0} was stopped while starting")]
    Interrupted(String),

    #[error("Conversation {0} has no plan to execute")]
    NoPlan(String),

    #[error("Plan execution is not configured")]
    PlansDisabled,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Options for [`StreamManager::start_stream`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// May be home-relative (`~/src`). Missing directories fall back to home.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    /// Defaults to act.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StreamMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl StartOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Options for [`StreamManager::execute_plan`]. The prompt is the plan itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePlanOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedStream {
    pub conversation_id: String,
    pub session_id: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStreamInfo {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub mode: StreamMode,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub subscriber_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInputEntry {
    pub conversation_id: String,
    #[serde(flatten)]
    pub request: UserInputRequestInfo,
}

/// Snapshot for a client that just connected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullState {
    pub active_streams: Vec<ActiveStreamInfo>,
    pub pending_user_inputs: Vec<PendingInputEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaInfo>,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<String, ConversationStream>,
    /// Session id to conversation id, for running streams only.
    routes: HashMap<String, String>,
    shutting_down: bool,
}

impl Registry {
    fn admit(&self, conversation_id: &str, limit: usize) -> Result<(), StreamError> {
        if self.shutting_down {
            return Err(StreamError::AlreadyShuttingDown);
        }
        if self
            .streams
            .get(conversation_id)
            .is_some_and(ConversationStream::is_running)
        {
            return Err(StreamError::DuplicateStream(conversation_id.to_string()));
        }
        let running = self.streams.values().filter(|s| s.is_running()).count();
        if running >= limit {
            return Err(StreamError::ConcurrencyExceeded(limit));
        }
        Ok(())
    }

    fn stream_for_run(&mut self, conversation_id: &str, run_id: &str) -> Option<&mut ConversationStream> {
        self.streams
            .get_mut(conversation_id)
            .filter(|s| s.run_id == run_id)
    }
}

pub(crate) struct ManagerInner {
    config: StreamManagerConfig,
    provider: Arc<dyn SessionProvider>,
    store: Arc<dyn ConversationStore>,
    plan_writer: Option<Arc<dyn PlanWriter>>,
    quota: QuotaCache,
    registry: Mutex<Registry>,
}

/// Cheap-to-clone handle to the shared stream registry.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn builder(
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn ConversationStore>,
    ) -> StreamManagerBuilder {
        StreamManagerBuilder::new(provider, store)
    }

    pub(crate) fn from_parts(
        config: StreamManagerConfig,
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn ConversationStore>,
        plan_writer: Option<Arc<dyn PlanWriter>>,
        quota: QuotaCache,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                provider,
                store,
                plan_writer,
                quota,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &StreamManagerConfig {
        &self.inner.config
    }

    /// Start a stream for a conversation and send it the prompt.
    ///
    /// Admission errors leave everything untouched. Only a running stream
    /// blocks a new one: an idle, errored or unsubscribed stream still in
    /// the registry is torn down and replaced. Once admitted, any failure
    /// marks the stream `error`, broadcasts an error event and is returned.
    ///
    /// Without an explicit `resume_session_id` the conversation's stored
    /// session is resumed, so one engine session serves every turn.
    pub async fn start_stream(
        &self,
        conversation_id: &str,
        options: StartOptions,
    ) -> Result<StartedStream, StreamError> {
        let inner = &self.inner;
        let mode = options.mode.unwrap_or_default();
        let working_dir = resolve_working_dir(options.working_dir.as_deref().unwrap_or(""));

        let (run_id, mode_cell) = {
            let mut registry = inner.registry.lock().unwrap();
            registry.admit(conversation_id, inner.config.max_concurrent_streams)?;

            if let Some(mut previous) = registry.streams.remove(conversation_id) {
                if let Some(session_id) = &previous.session_id {
                    registry.routes.remove(session_id);
                }
                previous.teardown();
            }

            let transcript = open_log_file(inner.config.log_dir.as_deref(), conversation_id);
            log_line(&transcript, "PROMPT", &options.prompt);

            let stream = ConversationStream::new(
                conversation_id,
                mode,
                working_dir.clone(),
                inner.config.user_input_timeout,
                transcript,
            );
            let ids = (stream.run_id.clone(), stream.mode.clone());
            registry.streams.insert(conversation_id.to_string(), stream);
            ids
        };

        log::info!(
            "Starting stream for {} in {} ({:?} mode)",
            conversation_id,
            working_dir.display(),
            mode
        );

        let stored_session_id = match &options.resume_session_id {
            Some(_) => None,
            None => inner.stored_session_id(conversation_id).await,
        };
        let resume_session_id = options
            .resume_session_id
            .clone()
            .or_else(|| stored_session_id.clone());

        let session_options = SessionOptions {
            resume_session_id,
            model: options.model.clone(),
            working_dir: working_dir.clone(),
            permission: PermissionHandler::new(mode_cell),
            user_input: UserInputBridge::new(Arc::downgrade(inner), conversation_id),
            system_message: inner
                .config
                .compose_system_message(mode, options.locale.as_deref()),
            skill_dirs: inner.config.skill_dirs.clone(),
            disabled_skills: options.disabled_skills.clone(),
            tools: inner.config.tools.clone(),
        };

        let ProviderSession { session_id, events } =
            match inner.provider.get_or_create_session(session_options).await {
                Ok(session) => session,
                Err(e) => {
                    inner.fail_stream(conversation_id, &run_id, &e.to_string());
                    return Err(e.into());
                }
            };

        let attached = {
            let mut registry = inner.registry.lock().unwrap();
            let registry = &mut *registry;
            match registry
                .streams
                .get_mut(conversation_id)
                .filter(|s| s.run_id == run_id && s.is_running())
            {
                Some(stream) => {
                    stream.session_id = Some(session_id.clone());
                    stream.pump = Some(inner.spawn_pump(session_id.clone(), events));
                    registry
                        .routes
                        .insert(session_id.clone(), conversation_id.to_string());
                    true
                }
                None => false,
            }
        };

        if !attached {
            log::info!(
                "Stream for {} was stopped before session {} attached",
                conversation_id,
                session_id
            );
            if let Err(e) = inner.provider.abort_message(&session_id).await {
                log::warn!("Failed to abort orphaned session {}: {}", session_id, e);
            }
            return Err(StreamError::Interrupted(conversation_id.to_string()));
        }

        if options.resume_session_id.is_none()
            && stored_session_id.as_deref() != Some(session_id.as_str())
        {
            inner.spawn_store_update(
                conversation_id,
                ConversationPatch::session_id(Some(session_id.clone())),
            );
        }

        if let Err(e) = inner
            .provider
            .send_message(&session_id, &options.prompt, &options.attachments)
            .await
        {
            inner.fail_stream(conversation_id, &run_id, &e.to_string());
            return Err(e.into());
        }

        Ok(StartedStream {
            conversation_id: conversation_id.to_string(),
            session_id,
            working_dir,
        })
    }

    /// Attach a sink to a stream. The sink first receives every buffered
    /// event, in order. Returns `None` if there is no stream.
    ///
    /// Dropping the returned [`Subscription`] detaches the sink.
    pub fn subscribe(&self, conversation_id: &str, sink: EventSink) -> Option<Subscription> {
        let mut registry = self.inner.registry.lock().unwrap();
        let stream = registry.streams.get_mut(conversation_id)?;
        let subscriber_id = stream.attach(sink);

        Some(Subscription {
            manager: Arc::downgrade(&self.inner),
            conversation_id: conversation_id.to_string(),
            run_id: stream.run_id.clone(),
            subscriber_id,
        })
    }

    /// Stop a running stream. Returns false if there is nothing to abort.
    pub async fn abort_stream(&self, conversation_id: &str) -> bool {
        let inner = &self.inner;
        let session_id = {
            let mut registry = inner.registry.lock().unwrap();
            let registry = &mut *registry;
            let Some(stream) = registry.streams.get_mut(conversation_id) else {
                return false;
            };
            if !stream.is_running() {
                return false;
            }

            stream.pending.reject_all();
            if let Some(session_id) = &stream.session_id {
                registry.routes.remove(session_id);
            }
            inner.spawn_flush(conversation_id, stream.accumulator.take_turn());
            stream.status = StreamStatus::Idle;
            stream.broadcast(StreamEvent::Idle { plan_path: None });
            if let Some(pump) = stream.pump.take() {
                pump.abort();
            }
            inner.schedule_removal(conversation_id, &stream.run_id);
            stream.session_id.clone()
        };

        log::info!("Aborted stream for {}", conversation_id);

        if let Some(session_id) = session_id {
            if let Err(e) = inner.provider.abort_message(&session_id).await {
                log::warn!("Failed to abort session {}: {}", session_id, e);
            }
        }
        true
    }

    /// Answer a pending question. Unknown conversations or requests are ignored.
    pub fn handle_user_input_response(
        &self,
        conversation_id: &str,
        request_id: &str,
        answer: String,
        was_freeform: bool,
    ) -> bool {
        let mut registry = self.inner.registry.lock().unwrap();
        let Some(stream) = registry.streams.get_mut(conversation_id) else {
            return false;
        };
        log_line(&stream.transcript, "ANSWER", &answer);
        stream.pending.resolve(
            request_id,
            UserInputResponse {
                answer,
                was_freeform,
            },
        )
    }

    pub fn set_mode(&self, conversation_id: &str, mode: StreamMode) -> bool {
        let mut registry = self.inner.registry.lock().unwrap();
        let Some(stream) = registry.streams.get_mut(conversation_id) else {
            return false;
        };
        stream.mode.set(mode);
        stream.broadcast(StreamEvent::ModeChanged { mode });
        true
    }

    /// Conversation ids of running streams, sorted.
    pub fn active_stream_ids(&self) -> Vec<String> {
        let registry = self.inner.registry.lock().unwrap();
        let mut ids: Vec<String> = registry
            .streams
            .values()
            .filter(|s| s.is_running())
            .map(|s| s.conversation_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn pending_user_inputs(&self, conversation_id: &str) -> Vec<UserInputRequestInfo> {
        let registry = self.inner.registry.lock().unwrap();
        registry
            .streams
            .get(conversation_id)
            .map(|s| s.pending.list())
            .unwrap_or_default()
    }

    /// Running streams, every pending question, and the latest quota.
    pub fn full_state(&self) -> FullState {
        let registry = self.inner.registry.lock().unwrap();
        let mut running: Vec<&ConversationStream> =
            registry.streams.values().filter(|s| s.is_running()).collect();
        running.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));

        let active_streams = running
            .iter()
            .map(|s| ActiveStreamInfo {
                conversation_id: s.conversation_id.clone(),
                session_id: s.session_id.clone(),
                mode: s.mode.get(),
                working_dir: s.working_dir.clone(),
                started_at: s.started_at,
                subscriber_count: s.bus.subscriber_count(),
            })
            .collect();

        let mut with_pending: Vec<&ConversationStream> = registry
            .streams
            .values()
            .filter(|s| !s.pending.is_empty())
            .collect();
        with_pending.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        let pending_user_inputs = with_pending
            .into_iter()
            .flat_map(|s| {
                s.pending.list().into_iter().map(|request| PendingInputEntry {
                    conversation_id: s.conversation_id.clone(),
                    request,
                })
            })
            .collect();

        FullState {
            active_streams,
            pending_user_inputs,
            quota: self.inner.quota.latest(),
        }
    }

    /// Stop everything: refuse new streams, reject every pending question,
    /// flush running turns and release the provider, bounded by `timeout`.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let flushes: Vec<(String, NewMessage)> = {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.shutting_down = true;
            registry.routes.clear();

            let mut flushes = Vec::new();
            for (conversation_id, mut stream) in registry.streams.drain() {
                let was_running = stream.is_running();
                stream.teardown();
                let turn = stream.accumulator.take_turn();
                if was_running && turn.has_content() {
                    flushes.push((
                        conversation_id,
                        NewMessage::assistant(turn.content(), turn.metadata()),
                    ));
                }
            }
            flushes
        };

        log::info!("Shutting down streams, flushing {} turn(s)", flushes.len());

        let store = self.inner.store.clone();
        let provider = self.inner.provider.clone();
        let work = async move {
            let writes = flushes.into_iter().map(|(conversation_id, message)| {
                let store = store.clone();
                async move {
                    if let Err(e) = store.add_message(&conversation_id, message).await {
                        log::warn!("Failed to flush {} during shutdown: {}", conversation_id, e);
                    }
                }
            });
            futures::future::join_all(writes).await;
            provider.shutdown().await;
        };

        if tokio::time::timeout(timeout, work).await.is_err() {
            log::warn!("Shutdown did not finish within {:?}", timeout);
        }
    }

    /// Drop all state and accept new streams again.
    pub fn reset(&self) {
        let mut registry = self.inner.registry.lock().unwrap();
        for (_, mut stream) in registry.streams.drain() {
            stream.teardown();
        }
        registry.routes.clear();
        registry.shutting_down = false;
        self.inner.quota.clear();
    }

    /// Run a conversation's recorded plan as the prompt of a fresh act-mode
    /// stream. The previous session is not resumed.
    pub async fn execute_plan(
        &self,
        conversation_id: &str,
        options: ExecutePlanOptions,
    ) -> Result<StartedStream, StreamError> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .admit(conversation_id, self.inner.config.max_concurrent_streams)?;

        let writer = self
            .inner
            .plan_writer
            .clone()
            .ok_or(StreamError::PlansDisabled)?;
        let conversation = self
            .inner
            .store
            .get_by_id(conversation_id)
            .await?
            .ok_or_else(|| StreamError::ConversationNotFound(conversation_id.to_string()))?;
        let plan_path = conversation
            .plan_path
            .ok_or_else(|| StreamError::NoPlan(conversation_id.to_string()))?;
        let plan = writer.read_plan(&plan_path).await?;

        self.inner
            .store
            .update(conversation_id, ConversationPatch::session_id(None))
            .await?;

        self.start_stream(
            conversation_id,
            StartOptions {
                prompt: plan,
                model: options.model,
                working_dir: options.working_dir,
                resume_session_id: None,
                mode: Some(StreamMode::Act),
                disabled_skills: options.disabled_skills,
                attachments: Vec::new(),
                locale: options.locale,
            },
        )
        .await
    }

    pub fn conversation_for_session(&self, session_id: &str) -> Option<String> {
        let registry = self.inner.registry.lock().unwrap();
        registry.routes.get(session_id).cloned()
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        let registry = self.inner.registry.lock().unwrap();
        registry
            .streams
            .get(conversation_id)
            .map(|s| s.bus.subscriber_count())
            .unwrap_or(0)
    }

    pub fn stream_status(&self, conversation_id: &str) -> Option<StreamStatus> {
        let registry = self.inner.registry.lock().unwrap();
        registry.streams.get(conversation_id).map(|s| s.status)
    }

    pub fn quota(&self) -> Option<QuotaInfo> {
        self.inner.quota.latest()
    }
}

impl ManagerInner {
    fn spawn_pump(
        self: &Arc<Self>,
        session_id: String,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !inner.process_engine_event(&session_id, event).await {
                    break;
                }
            }
            log::debug!("Event pump for session {} stopped", session_id);
        })
    }

    /// Apply one engine event. Returns false once the pump should stop.
    async fn process_engine_event(self: &Arc<Self>, session_id: &str, event: EngineEvent) -> bool {
        let raw = serde_json::to_string(&event).unwrap_or_default();

        let (conversation_id, plan_content) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(conversation_id) = registry.routes.get(session_id).cloned() else {
                return false;
            };
            let Some(stream) = registry.streams.get_mut(&conversation_id) else {
                return false;
            };
            log_line(&stream.transcript, "ENGINE", &raw);

            match stream.accumulator.ingest(event, &self.quota) {
                Ingested::Forward(event) => {
                    if matches!(event, StreamEvent::TextDelta { .. }) {
                        stream.status = StreamStatus::Running;
                    }
                    stream.broadcast(event);
                    return true;
                }
                Ingested::Dropped => return true,
                Ingested::Failed(message) => {
                    log::warn!("Session {} reported an error: {}", session_id, message);
                    stream.status = StreamStatus::Error;
                    stream.broadcast(StreamEvent::Error { message });
                    return true;
                }
                Ingested::Idle => {
                    let accumulation = &stream.accumulator.accumulation;
                    let plan_content = (stream.mode.get() == StreamMode::Plan
                        && self.plan_writer.is_some()
                        && !accumulation.text_segments.is_empty())
                    .then(|| accumulation.content());
                    (conversation_id, plan_content)
                }
            }
        };

        let plan_path = match (plan_content, self.plan_writer.as_ref()) {
            (Some(content), Some(writer)) => {
                match writer.write_plan(&conversation_id, &content).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        log::warn!("Failed to write plan for {}: {}", conversation_id, e);
                        None
                    }
                }
            }
            _ => None,
        };

        self.finish_turn(session_id, plan_path);
        false
    }

    /// Flush the turn, mark the stream idle and release its routing entry.
    fn finish_turn(self: &Arc<Self>, session_id: &str, plan_path: Option<PathBuf>) {
        let mut registry = self.registry.lock().unwrap();
        let Some(conversation_id) = registry.routes.remove(session_id) else {
            // Aborted while the plan was being written.
            return;
        };
        let Some(stream) = registry.streams.get_mut(&conversation_id) else {
            return;
        };

        self.spawn_flush(&conversation_id, stream.accumulator.take_turn());
        if let Some(path) = &plan_path {
            self.spawn_store_update(
                &conversation_id,
                ConversationPatch::plan_path(Some(path.clone())),
            );
        }

        stream.status = StreamStatus::Idle;
        // The pump is the caller and exits on its own.
        stream.pump = None;
        stream.pending.reject_all();
        stream.broadcast(StreamEvent::Idle {
            plan_path: plan_path.map(|p| p.display().to_string()),
        });
        self.schedule_removal(&conversation_id, &stream.run_id);

        log::info!("Stream for {} is idle", conversation_id);
    }

    fn fail_stream(&self, conversation_id: &str, run_id: &str, message: &str) {
        log::warn!("Stream for {} failed: {}", conversation_id, message);
        let mut registry = self.registry.lock().unwrap();
        if let Some(stream) = registry.stream_for_run(conversation_id, run_id) {
            stream.status = StreamStatus::Error;
            stream.broadcast(StreamEvent::Error {
                message: message.to_string(),
            });
        }
    }

    /// Remove a finished stream on the next scheduler tick, unless it was
    /// replaced or restarted in the meantime.
    fn schedule_removal(self: &Arc<Self>, conversation_id: &str, run_id: &str) {
        let inner = Arc::downgrade(self);
        let conversation_id = conversation_id.to_string();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut registry = inner.registry.lock().unwrap();
            let finished = registry
                .stream_for_run(&conversation_id, &run_id)
                .is_some_and(|s| !s.is_running());
            if finished {
                if let Some(mut stream) = registry.streams.remove(&conversation_id) {
                    stream.teardown();
                }
            }
        });
    }

    fn spawn_flush(&self, conversation_id: &str, turn: Accumulation) {
        if !turn.has_content() {
            return;
        }
        let message = NewMessage::assistant(turn.content(), turn.metadata());
        let store = self.store.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.add_message(&conversation_id, message).await {
                log::warn!("Failed to persist turn for {}: {}", conversation_id, e);
            }
        });
    }

    async fn stored_session_id(&self, conversation_id: &str) -> Option<String> {
        match self.store.get_by_id(conversation_id).await {
            Ok(conversation) => conversation.and_then(|c| c.session_id),
            Err(e) => {
                log::warn!(
                    "Failed to read session id for {}, starting a new session: {}",
                    conversation_id,
                    e
                );
                None
            }
        }
    }

    fn spawn_store_update(&self, conversation_id: &str, patch: ConversationPatch) {
        let store = self.store.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.update(&conversation_id, patch).await {
                log::warn!("Failed to update conversation {}: {}", conversation_id, e);
            }
        });
    }

    /// Record a question from the engine and announce it to subscribers.
    ///
    /// Returns `None` when the conversation has no stream.
    pub(crate) fn register_user_input(
        self: &Arc<Self>,
        conversation_id: &str,
        prompt: UserInputPrompt,
    ) -> Option<oneshot::Receiver<UserInputResult>> {
        let mut registry = self.registry.lock().unwrap();
        let stream = registry.streams.get_mut(conversation_id)?;

        let (tx, rx) = oneshot::channel();
        let active = stream.bus.subscriber_count() > 0;
        let hook = self.timeout_hook(conversation_id, &stream.run_id);
        let info = stream.pending.insert(prompt, tx, hook, active);

        log_line(&stream.transcript, "INPUT", &info.question);
        stream.broadcast(StreamEvent::UserInputRequest(info));
        Some(rx)
    }

    fn timeout_hook(self: &Arc<Self>, conversation_id: &str, run_id: &str) -> TimeoutHook {
        let inner = Arc::downgrade(self);
        let conversation_id = conversation_id.to_string();
        let run_id = run_id.to_string();
        Arc::new(move |request_id: &str, epoch: u64| {
            if let Some(inner) = inner.upgrade() {
                inner.expire_user_input(&conversation_id, &run_id, request_id, epoch);
            }
        })
    }

    fn expire_user_input(&self, conversation_id: &str, run_id: &str, request_id: &str, epoch: u64) {
        let mut registry = self.registry.lock().unwrap();
        let Some(stream) = registry.stream_for_run(conversation_id, run_id) else {
            return;
        };
        if let Some((request_id, prompt)) = stream.pending.expire(request_id, epoch) {
            log::info!("User input {} for {} timed out", request_id, conversation_id);
            stream.broadcast(StreamEvent::UserInputTimeout {
                request_id,
                question: prompt.question,
                choices: prompt.choices,
            });
        }
    }

    fn detach(&self, conversation_id: &str, run_id: &str, subscriber_id: SubscriberId) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(stream) = registry.stream_for_run(conversation_id, run_id) {
            stream.detach(subscriber_id);
        }
    }
}

/// Detach handle returned by [`StreamManager::subscribe`].
#[must_use = "dropping a Subscription detaches the sink"]
pub struct Subscription {
    manager: Weak<ManagerInner>,
    conversation_id: String,
    run_id: String,
    subscriber_id: SubscriberId,
}

impl Subscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Whether the sink is still attached to the stream it subscribed to.
    /// False once that stream is removed, replaced, or the sink was dropped.
    pub fn is_attached(&self) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        let registry = inner.registry.lock().unwrap();
        registry
            .streams
            .get(&self.conversation_id)
            .filter(|s| s.run_id == self.run_id)
            .is_some_and(|s| s.bus.is_attached(self.subscriber_id))
    }

    /// Detach now. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.detach(&self.conversation_id, &self.run_id, self.subscriber_id);
        }
    }
}
