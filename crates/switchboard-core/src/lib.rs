//! # switchboard-core
//!
//! Core stream management for Switchboard, the conversation multiplexer that
//! sits between thin chat clients and slow, interactive AI execution engines.
//!
//! This crate is framework-agnostic and can be used by:
//! - The HTTP/WebSocket boundary (`switchboard-http`)
//! - The daemon binary (`switchboard-daemon`)
//! - Tests and embedders that bring their own collaborators
//!
//! ## Key Concepts
//!
//! - **Stream**: the live, in-memory state of one conversation's interaction
//!   with an engine session
//! - **Turn**: one assistant response cycle, flushed as a single message on idle
//! - **EngineEvent**: raw event delivered by a session
//! - **StreamEvent**: normalized event delivered to subscribers

pub mod config;
pub mod engine;
pub mod logging;
pub mod paths;
pub mod persistence;
pub mod plan;
pub mod quota;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{StreamManagerBuilder, StreamManagerConfig};
pub use engine::event::EngineEvent;
pub use engine::process::{ProcessProviderConfig, ProcessSessionProvider};
pub use engine::provider::{
    Attachment, ProviderError, ProviderSession, SessionOptions, SessionProvider, ToolCapability,
};
pub use persistence::{ConversationStore, JsonFileStore, MemoryStore, StoreError};
pub use plan::{FilePlanWriter, PlanError, PlanWriter};
pub use quota::{QuotaCache, QuotaInfo};
pub use stream::{
    EventSink, ExecutePlanOptions, FullState, StartOptions, StreamError, StreamEvent,
    StreamManager, StreamMessage, StreamMode, StreamStatus, Subscription,
};
