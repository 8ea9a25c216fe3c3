//! Per-stream fan-out with replay.
//!
//! Every event published on a stream's bus is enriched with the conversation
//! id, appended to the replay buffer, and then sent to each attached sink.
//! A sink attached mid-stream first receives the whole buffer, in order, and
//! only then joins the live fan-out.
//!
//! # Example
//!
//! ```rust
//! use switchboard_core::stream::event_bus::EventBus;
//! use switchboard_core::StreamEvent;
//! use tokio::sync::mpsc;
//!
//! let mut bus = EventBus::new("conv-1");
//! bus.publish(StreamEvent::Error { message: "boom".into() });
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! bus.attach(tx);
//! assert!(rx.try_recv().is_ok());
//! ```

use tokio::sync::mpsc;

use super::event::{StreamEvent, StreamMessage};

/// Receiving end a subscriber hands to the manager.
pub type EventSink = mpsc::UnboundedSender<StreamMessage>;

/// Unique identifier for an attached sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

pub struct EventBus {
    conversation_id: String,
    replay: Vec<StreamMessage>,
    subscribers: Vec<(SubscriberId, EventSink)>,
    next_id: u64,
}

impl EventBus {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            replay: Vec::new(),
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    /// Buffer the event and deliver it to every attached sink.
    ///
    /// A closed sink is dropped from the live set; delivery to the rest
    /// continues. Returns the number of sinks that accepted the event.
    pub fn publish(&mut self, event: StreamEvent) -> usize {
        let message = StreamMessage::new(self.conversation_id.clone(), event);
        self.replay.push(message.clone());

        let conversation_id = &self.conversation_id;
        self.subscribers.retain(|(id, sink)| {
            let open = sink.send(message.clone()).is_ok();
            if !open {
                log::debug!("Dropping closed subscriber {} of {}", id.0, conversation_id);
            }
            open
        });
        self.subscribers.len()
    }

    /// Replay the buffer to `sink`, then add it to the live set.
    pub fn attach(&mut self, sink: EventSink) -> SubscriberId {
        for message in &self.replay {
            if sink.send(message.clone()).is_err() {
                break;
            }
        }

        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, sink));
        id
    }

    /// Remove a sink. Returns whether it was attached.
    pub fn detach(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn is_attached(&self, id: SubscriberId) -> bool {
        self.subscribers.iter().any(|(sid, _)| *sid == id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(message: &str) -> StreamEvent {
        StreamEvent::Error {
            message: message.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamMessage>) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    mod publish {
        use super::*;

        #[test]
        fn without_subscribers_still_buffers() {
            let mut bus = EventBus::new("c1");
            assert_eq!(bus.publish(error("a")), 0);
            assert_eq!(bus.replay_len(), 1);
        }

        #[test]
        fn enriches_with_conversation_id() {
            let mut bus = EventBus::new("c1");
            let (tx, mut rx) = mpsc::unbounded_channel();
            bus.attach(tx);

            bus.publish(error("a"));

            let received = drain(&mut rx);
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].conversation_id, "c1");
        }

        #[test]
        fn closed_sink_does_not_block_others() {
            let mut bus = EventBus::new("c1");
            let (closed_tx, closed_rx) = mpsc::unbounded_channel();
            let (open_tx, mut open_rx) = mpsc::unbounded_channel();
            bus.attach(closed_tx);
            bus.attach(open_tx);
            drop(closed_rx);

            assert_eq!(bus.publish(error("a")), 1);
            assert_eq!(drain(&mut open_rx).len(), 1);
        }

        #[test]
        fn closed_sink_is_dropped() {
            let mut bus = EventBus::new("c1");
            let (tx, rx) = mpsc::unbounded_channel();
            bus.attach(tx);
            drop(rx);
            assert_eq!(bus.subscriber_count(), 1);

            bus.publish(error("a"));
            assert_eq!(bus.subscriber_count(), 0);
        }
    }

    mod attach {
        use super::*;

        #[test]
        fn replays_buffer_in_order_before_live_events() {
            let mut bus = EventBus::new("c1");
            for i in 0..5 {
                bus.publish(error(&i.to_string()));
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            bus.attach(tx);
            bus.publish(error("live"));

            let messages: Vec<String> = drain(&mut rx)
                .into_iter()
                .map(|m| match m.event {
                    StreamEvent::Error { message } => message,
                    other => panic!("unexpected {:?}", other),
                })
                .collect();
            assert_eq!(messages, vec!["0", "1", "2", "3", "4", "live"]);
        }

        #[test]
        fn ids_are_unique() {
            let mut bus = EventBus::new("c1");
            let (tx1, _rx1) = mpsc::unbounded_channel();
            let (tx2, _rx2) = mpsc::unbounded_channel();
            assert_ne!(bus.attach(tx1), bus.attach(tx2));
            assert_eq!(bus.subscriber_count(), 2);
        }
    }

    #[test]
    fn detach_stops_delivery() {
        let mut bus = EventBus::new("c1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.attach(tx);

        assert!(bus.is_attached(id));
        assert!(bus.detach(id));
        assert!(!bus.detach(id));
        assert!(!bus.is_attached(id));
        bus.publish(error("after"));

        assert!(drain(&mut rx).is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
