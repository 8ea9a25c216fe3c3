//! The live state of one conversation's interaction with an engine session.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::accumulator::Accumulator;
use super::bridge::ModeCell;
use super::event::{StreamEvent, StreamMode, StreamStatus};
use super::event_bus::{EventBus, EventSink, SubscriberId};
use super::pending_input::PendingInputs;
use crate::logging::LogHandle;

pub struct ConversationStream {
    pub conversation_id: String,
    /// Distinguishes this stream from a later one for the same conversation,
    /// so deferred work aimed at an old stream cannot touch its replacement.
    pub run_id: String,
    /// Set once the provider hands back a session.
    pub session_id: Option<String>,
    pub status: StreamStatus,
    pub mode: ModeCell,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub accumulator: Accumulator,
    pub bus: EventBus,
    pub pending: PendingInputs,
    /// Task draining the session's event receiver.
    pub pump: Option<JoinHandle<()>>,
    pub transcript: LogHandle,
}

impl ConversationStream {
    pub fn new(
        conversation_id: impl Into<String>,
        mode: StreamMode,
        working_dir: PathBuf,
        user_input_timeout: Duration,
        transcript: LogHandle,
    ) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            bus: EventBus::new(conversation_id.clone()),
            conversation_id,
            run_id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            status: StreamStatus::Running,
            mode: ModeCell::new(mode),
            working_dir,
            started_at: Utc::now(),
            accumulator: Accumulator::new(),
            pending: PendingInputs::new(user_input_timeout),
            pump: None,
            transcript,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == StreamStatus::Running
    }

    /// Publish to every sink. Losing the last sink freezes input timers.
    pub fn broadcast(&mut self, event: StreamEvent) {
        let before = self.bus.subscriber_count();
        if self.bus.publish(event) == 0 && before > 0 {
            self.pending.pause_all();
        }
    }

    /// Attach a sink. The first subscriber restarts frozen input timers.
    pub fn attach(&mut self, sink: EventSink) -> SubscriberId {
        let id = self.bus.attach(sink);
        if self.bus.subscriber_count() == 1 {
            self.pending.resume_all();
        }
        id
    }

    /// Detach a sink. When nobody is left, input timers freeze.
    pub fn detach(&mut self, id: SubscriberId) {
        if self.bus.detach(id) && self.bus.subscriber_count() == 0 {
            self.pending.pause_all();
        }
    }

    /// Reject outstanding questions and stop draining the session.
    pub fn teardown(&mut self) {
        let rejected = self.pending.reject_all();
        if rejected > 0 {
            log::debug!(
                "Rejected {} pending input(s) for {}",
                rejected,
                self.conversation_id
            );
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
