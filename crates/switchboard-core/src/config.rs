//! Stream manager configuration and construction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::provider::{SessionProvider, ToolCapability};
use crate::persistence::ConversationStore;
use crate::plan::PlanWriter;
use crate::quota::QuotaCache;
use crate::stream::pending_input::DEFAULT_USER_INPUT_TIMEOUT;
use crate::stream::{StreamManager, StreamMode};

/// Maximum number of streams that may be running at once.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 3;

/// Default budget for flushing and releasing sessions during shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const PLAN_MODE_NOTE: &str = "You are in plan mode. Do not modify files or run commands. \
Investigate as needed and reply with a step-by-step plan the user can review and execute.";

#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    pub max_concurrent_streams: usize,
    /// How long a question may wait for an answer while someone is watching.
    pub user_input_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub skill_dirs: Vec<PathBuf>,
    pub tools: Vec<ToolCapability>,
    /// Base system message sent with every session.
    pub system_message: Option<String>,
    /// Directory for per-conversation transcript logs. Disabled when `None`.
    pub log_dir: Option<PathBuf>,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            user_input_timeout: DEFAULT_USER_INPUT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            skill_dirs: Vec::new(),
            tools: Vec::new(),
            system_message: None,
            log_dir: None,
        }
    }
}

impl StreamManagerConfig {
    /// Compose the system message for one stream start.
    ///
    /// Returns `None` when there is nothing to say.
    pub fn compose_system_message(&self, mode: StreamMode, locale: Option<&str>) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        if let Some(base) = self.system_message.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(base.trim().to_string());
        }
        if mode == StreamMode::Plan {
            parts.push(PLAN_MODE_NOTE.to_string());
        }
        if let Some(locale) = locale.filter(|l| !l.trim().is_empty()) {
            parts.push(format!("Respond in the user's language (locale: {}).", locale.trim()));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// Builder for [`StreamManager`].
///
/// The provider and store are required; everything else has a default.
pub struct StreamManagerBuilder {
    provider: Arc<dyn SessionProvider>,
    store: Arc<dyn ConversationStore>,
    config: StreamManagerConfig,
    plan_writer: Option<Arc<dyn PlanWriter>>,
    quota: Option<QuotaCache>,
}

impl StreamManagerBuilder {
    pub fn new(provider: Arc<dyn SessionProvider>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            provider,
            store,
            config: StreamManagerConfig::default(),
            plan_writer: None,
            quota: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: StreamManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent_streams(mut self, limit: usize) -> Self {
        self.config.max_concurrent_streams = limit;
        self
    }

    pub fn user_input_timeout(mut self, timeout: Duration) -> Self {
        self.config.user_input_timeout = timeout;
        self
    }

    pub fn log_dir(mut self, dir: PathBuf) -> Self {
        self.config.log_dir = Some(dir);
        self
    }

    /// Enable plan artifacts for plan-mode turns and `execute_plan`.
    pub fn plan_writer(mut self, writer: Arc<dyn PlanWriter>) -> Self {
        self.plan_writer = Some(writer);
        self
    }

    /// Share an existing quota cache (for example with another manager).
    pub fn quota_cache(mut self, quota: QuotaCache) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn build(self) -> StreamManager {
        StreamManager::from_parts(
            self.config,
            self.provider,
            self.store,
            self.plan_writer,
            self.quota.unwrap_or_default(),
        )
    }
}
