//! Conversation streams and the manager that owns them.
//!
//! - [`manager`]: admission, routing, flushing and shutdown
//! - [`state`]: one conversation's live stream
//! - [`accumulator`] / [`accumulation`]: folding engine events into a turn
//! - [`event_bus`]: per-stream fan-out with replay
//! - [`pending_input`]: human-input questions with pausable timeouts
//! - [`bridge`]: the permission and user-input callbacks given to providers

pub mod accumulation;
pub mod accumulator;
pub mod bridge;
pub mod event;
pub mod event_bus;
pub mod manager;
pub mod pending_input;
pub mod state;

pub use event::{StreamEvent, StreamMessage, StreamMode, StreamStatus};
pub use event_bus::EventSink;
pub use manager::{
    ActiveStreamInfo, ExecutePlanOptions, FullState, PendingInputEntry, StartOptions,
    StartedStream, StreamError, StreamManager, Subscription,
};
