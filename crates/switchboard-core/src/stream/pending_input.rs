//! Outstanding human-input questions for one stream.
//!
//! # Timer States
//!
//! ```text
//!            last subscriber leaves
//!   Active ─────────────────────────▶ Paused { remaining }
//!     ▲                                   │
//!     └───────────────────────────────────┘
//!        first subscriber attaches (remaining > 0)
//! ```
//!
//! A request created while nobody is watching starts Paused with the full
//! budget, so an unobserved question can never time out. Every (re)arm bumps
//! the request's epoch; a timer whose epoch is stale when it fires is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_USER_INPUT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A question an engine wants a human to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputPrompt {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default = "default_allow_freeform")]
    pub allow_freeform: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_select: Option<bool>,
}

fn default_allow_freeform() -> bool {
    true
}

impl UserInputPrompt {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            choices: None,
            allow_freeform: true,
            multi_select: None,
        }
    }
}

/// Client-facing view of a pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputRequestInfo {
    pub request_id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    pub allow_freeform: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_select: Option<bool>,
    pub created_at: DateTime<Utc>,
    /// Time left before the request times out, frozen while paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
    /// Set while the countdown is frozen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputResponse {
    pub answer: String,
    pub was_freeform: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInputError {
    #[error("user input request aborted")]
    Aborted,

    #[error("user input request timed out")]
    TimedOut,
}

pub type UserInputResult = Result<UserInputResponse, UserInputError>;

/// Called from the timer task with `(request_id, epoch)` when a countdown ends.
pub type TimeoutHook = Arc<dyn Fn(&str, u64) + Send + Sync>;

enum TimerState {
    Active {
        started_at: Instant,
        budget: Duration,
        task: JoinHandle<()>,
    },
    Paused {
        remaining: Duration,
        paused_at: DateTime<Utc>,
    },
}

impl TimerState {
    fn remaining(&self) -> Duration {
        match self {
            TimerState::Active {
                started_at, budget, ..
            } => budget.saturating_sub(started_at.elapsed()),
            TimerState::Paused { remaining, .. } => *remaining,
        }
    }
}

pub struct PendingUserInput {
    request_id: String,
    prompt: UserInputPrompt,
    created_at: DateTime<Utc>,
    responder: Option<oneshot::Sender<UserInputResult>>,
    timer: TimerState,
    epoch: u64,
    on_timeout: TimeoutHook,
}

impl PendingUserInput {
    fn arm(&mut self, budget: Duration) {
        self.disarm();
        self.epoch += 1;

        let hook = self.on_timeout.clone();
        let request_id = self.request_id.clone();
        let epoch = self.epoch;
        let task = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            hook(&request_id, epoch);
        });

        self.timer = TimerState::Active {
            started_at: Instant::now(),
            budget,
            task,
        };
    }

    fn pause(&mut self) {
        if let TimerState::Active { .. } = self.timer {
            let remaining = self.timer.remaining();
            self.disarm();
            self.epoch += 1;
            self.timer = TimerState::Paused {
                remaining,
                paused_at: Utc::now(),
            };
        }
    }

    fn disarm(&mut self) {
        if let TimerState::Active { task, .. } = &self.timer {
            task.abort();
        }
    }

    fn settle(mut self, outcome: UserInputResult) {
        self.disarm();
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(outcome);
        }
    }

    fn info(&self) -> UserInputRequestInfo {
        UserInputRequestInfo {
            request_id: self.request_id.clone(),
            question: self.prompt.question.clone(),
            choices: self.prompt.choices.clone(),
            allow_freeform: self.prompt.allow_freeform,
            multi_select: self.prompt.multi_select,
            created_at: self.created_at,
            remaining_ms: Some(self.timer.remaining().as_millis() as u64),
            paused_at: match self.timer {
                TimerState::Paused { paused_at, .. } => Some(paused_at),
                TimerState::Active { .. } => None,
            },
        }
    }
}

impl Drop for PendingUserInput {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Registry of a stream's pending requests, keyed by request id.
pub struct PendingInputs {
    requests: HashMap<String, PendingUserInput>,
    timeout: Duration,
}

impl PendingInputs {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            timeout,
        }
    }

    /// Record a new request. With `active` the countdown starts now,
    /// otherwise the request waits paused with the full budget.
    ///
    /// Must be called from within a tokio runtime.
    pub fn insert(
        &mut self,
        prompt: UserInputPrompt,
        responder: oneshot::Sender<UserInputResult>,
        on_timeout: TimeoutHook,
        active: bool,
    ) -> UserInputRequestInfo {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut pending = PendingUserInput {
            request_id: request_id.clone(),
            prompt,
            created_at: Utc::now(),
            responder: Some(responder),
            timer: TimerState::Paused {
                remaining: self.timeout,
                paused_at: Utc::now(),
            },
            epoch: 0,
            on_timeout,
        };
        if active {
            pending.arm(self.timeout);
        }

        let info = pending.info();
        self.requests.insert(request_id, pending);
        info
    }

    /// Answer a request. Returns false if it is unknown (already answered,
    /// timed out or torn down).
    pub fn resolve(&mut self, request_id: &str, response: UserInputResponse) -> bool {
        match self.requests.remove(request_id) {
            Some(pending) => {
                pending.settle(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Time out a request if `epoch` is still its current countdown.
    ///
    /// Returns the prompt of the expired request so the caller can announce it.
    pub fn expire(&mut self, request_id: &str, epoch: u64) -> Option<(String, UserInputPrompt)> {
        let current = self.requests.get(request_id)?;
        if current.epoch != epoch || !matches!(current.timer, TimerState::Active { .. }) {
            return None;
        }

        let pending = self.requests.remove(request_id)?;
        let prompt = pending.prompt.clone();
        let request_id = pending.request_id.clone();
        pending.settle(Err(UserInputError::TimedOut));
        Some((request_id, prompt))
    }

    /// Freeze every running countdown.
    pub fn pause_all(&mut self) {
        for pending in self.requests.values_mut() {
            pending.pause();
        }
    }

    /// Restart every frozen countdown that still has time left.
    pub fn resume_all(&mut self) {
        for pending in self.requests.values_mut() {
            if let TimerState::Paused { remaining, .. } = pending.timer {
                if !remaining.is_zero() {
                    pending.arm(remaining);
                }
            }
        }
    }

    /// Reject every request with [`UserInputError::Aborted`]. Returns how many
    /// were outstanding.
    pub fn reject_all(&mut self) -> usize {
        let count = self.requests.len();
        for (_, pending) in self.requests.drain() {
            pending.settle(Err(UserInputError::Aborted));
        }
        count
    }

    /// Pending requests, oldest first.
    pub fn list(&self) -> Vec<UserInputRequestInfo> {
        let mut infos: Vec<_> = self.requests.values().map(PendingUserInput::info).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_paused(&self, request_id: &str) -> Option<bool> {
        self.requests
            .get(request_id)
            .map(|p| matches!(p.timer, TimerState::Paused { .. }))
    }
}
