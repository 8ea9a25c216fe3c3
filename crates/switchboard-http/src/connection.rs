//! One client connection's view of the stream manager.

use std::collections::HashMap;

use switchboard_core::{EventSink, StreamError, StreamManager, Subscription};

use crate::protocol::{ClientAction, ServerMessage};

/// Dispatches client actions and tracks which streams this client follows.
///
/// Stream events go to `sink`; [`Connection::handle`] returns the direct
/// replies. Callers should send the replies before draining the sink so a
/// `subscribed` reply precedes its replay.
pub struct Connection {
    manager: StreamManager,
    sink: EventSink,
    subscriptions: HashMap<String, Subscription>,
}

impl Connection {
    pub fn new(manager: StreamManager, sink: EventSink) -> Self {
        Self {
            manager,
            sink,
            subscriptions: HashMap::new(),
        }
    }

    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.subscriptions.contains_key(conversation_id)
    }

    pub async fn handle(&mut self, action: ClientAction) -> Vec<ServerMessage> {
        match action {
            ClientAction::Start {
                conversation_id,
                options,
            } => {
                let result = self.manager.start_stream(&conversation_id, options).await;
                self.started(&conversation_id, result)
            }
            ClientAction::ExecutePlan {
                conversation_id,
                options,
            } => {
                let result = self.manager.execute_plan(&conversation_id, options).await;
                self.started(&conversation_id, result)
            }
            ClientAction::Subscribe { conversation_id } => vec![self.subscribe(&conversation_id)],
            ClientAction::Unsubscribe { conversation_id } => {
                self.subscriptions.remove(&conversation_id);
                vec![ServerMessage::Unsubscribed { conversation_id }]
            }
            ClientAction::Status => vec![ServerMessage::Status {
                active_stream_ids: self.manager.active_stream_ids(),
            }],
            ClientAction::Abort { conversation_id } => {
                if self.manager.abort_stream(&conversation_id).await {
                    Vec::new()
                } else {
                    vec![ServerMessage::error(
                        Some(&conversation_id),
                        "No running stream",
                    )]
                }
            }
            ClientAction::AnswerUserInput {
                conversation_id,
                request_id,
                answer,
                was_freeform,
            } => {
                let accepted = self.manager.handle_user_input_response(
                    &conversation_id,
                    &request_id,
                    answer,
                    was_freeform,
                );
                if accepted {
                    Vec::new()
                } else {
                    vec![ServerMessage::error(
                        Some(&conversation_id),
                        format!("No pending request {}", request_id),
                    )]
                }
            }
            ClientAction::SetMode {
                conversation_id,
                mode,
            } => {
                if self.manager.set_mode(&conversation_id, mode) {
                    Vec::new()
                } else {
                    vec![ServerMessage::error(Some(&conversation_id), "No stream")]
                }
            }
            ClientAction::FullState => {
                let state = self.manager.full_state();
                let ids: Vec<String> = state
                    .active_streams
                    .iter()
                    .map(|s| s.conversation_id.clone())
                    .collect();

                let mut replies = vec![ServerMessage::FullState(state)];
                for id in ids {
                    if !self.is_subscribed(&id) {
                        replies.push(self.subscribe(&id));
                    }
                }
                replies
            }
        }
    }

    fn started(
        &mut self,
        conversation_id: &str,
        result: Result<switchboard_core::stream::StartedStream, StreamError>,
    ) -> Vec<ServerMessage> {
        match result {
            Ok(started) => vec![
                ServerMessage::Started(started),
                self.subscribe(conversation_id),
            ],
            Err(e) => {
                log::warn!("Start failed for {}: {}", conversation_id, e);
                vec![ServerMessage::error(Some(conversation_id), e.to_string())]
            }
        }
    }

    /// Attach the sink and replay the buffer. A client already following the
    /// current stream is left as is, so nothing is delivered twice.
    fn subscribe(&mut self, conversation_id: &str) -> ServerMessage {
        if self
            .subscriptions
            .get(conversation_id)
            .is_some_and(Subscription::is_attached)
        {
            return ServerMessage::Subscribed {
                conversation_id: conversation_id.to_string(),
            };
        }
        self.subscriptions.remove(conversation_id);

        match self.manager.subscribe(conversation_id, self.sink.clone()) {
            Some(subscription) => {
                self.subscriptions
                    .insert(conversation_id.to_string(), subscription);
                ServerMessage::Subscribed {
                    conversation_id: conversation_id.to_string(),
                }
            }
            None => ServerMessage::error(Some(conversation_id), "No active stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use switchboard_core::{
        Attachment, EngineEvent, MemoryStore, ProviderError, ProviderSession, SessionOptions,
        SessionProvider, StartOptions, StreamEvent, StreamMessage,
    };
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct ScriptedProvider {
        senders: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
    }

    impl ScriptedProvider {
        fn emit(&self, event: EngineEvent) {
            let senders = self.senders.lock().unwrap();
            senders.last().unwrap().send(event).unwrap();
        }
    }

    #[async_trait]
    impl SessionProvider for ScriptedProvider {
        async fn get_or_create_session(
            &self,
            _options: SessionOptions,
        ) -> Result<ProviderSession, ProviderError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut senders = self.senders.lock().unwrap();
            senders.push(tx);
            Ok(ProviderSession {
                session_id: format!("s{}", senders.len()),
                events: rx,
            })
        }

        async fn send_message(
            &self,
            _session_id: &str,
            _prompt: &str,
            _attachments: &[Attachment],
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn abort_message(&self, _session_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Fixture {
        provider: Arc<ScriptedProvider>,
        connection: Connection,
        events: mpsc::UnboundedReceiver<StreamMessage>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(ScriptedProvider::default());
        let manager =
            StreamManager::builder(provider.clone(), Arc::new(MemoryStore::new())).build();
        let (tx, events) = mpsc::unbounded_channel();
        Fixture {
            provider,
            connection: Connection::new(manager, tx),
            events,
        }
    }

    fn start(conversation_id: &str) -> ClientAction {
        ClientAction::Start {
            conversation_id: conversation_id.to_string(),
            options: StartOptions::new("hello"),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<StreamMessage>) -> StreamMessage {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn start_subscribes_and_streams() {
        let mut f = fixture();

        let replies = f.connection.handle(start("c1")).await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[0], ServerMessage::Started(s) if s.conversation_id == "c1"));
        assert_eq!(
            replies[1],
            ServerMessage::Subscribed {
                conversation_id: "c1".to_string()
            }
        );
        assert!(f.connection.is_subscribed("c1"));

        f.provider.emit(EngineEvent::TextMessage {
            message_id: "m1".to_string(),
            content: "hi".to_string(),
        });

        let message = next_event(&mut f.events).await;
        assert_eq!(message.conversation_id, "c1");
        assert!(matches!(message.event, StreamEvent::TextMessage { .. }));
    }

    #[tokio::test]
    async fn resubscribe_does_not_replay() {
        let mut f = fixture();
        f.connection.handle(start("c1")).await;
        f.provider.emit(EngineEvent::TextMessage {
            message_id: "m1".to_string(),
            content: "first".to_string(),
        });
        assert!(matches!(
            next_event(&mut f.events).await.event,
            StreamEvent::TextMessage { message_id, .. } if message_id == "m1"
        ));

        let replies = f
            .connection
            .handle(ClientAction::Subscribe {
                conversation_id: "c1".to_string(),
            })
            .await;
        assert_eq!(
            replies,
            vec![ServerMessage::Subscribed {
                conversation_id: "c1".to_string()
            }]
        );

        f.provider.emit(EngineEvent::TextMessage {
            message_id: "m2".to_string(),
            content: "second".to_string(),
        });
        assert!(matches!(
            next_event(&mut f.events).await.event,
            StreamEvent::TextMessage { message_id, .. } if message_id == "m2"
        ));
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_follows_new_stream() {
        let mut f = fixture();
        f.connection.handle(start("c1")).await;
        f.connection
            .handle(ClientAction::Abort {
                conversation_id: "c1".to_string(),
            })
            .await;
        assert!(matches!(
            next_event(&mut f.events).await.event,
            StreamEvent::Idle { .. }
        ));

        let replies = f.connection.handle(start("c1")).await;
        assert!(matches!(&replies[0], ServerMessage::Started(_)));
        f.provider.emit(EngineEvent::TextMessage {
            message_id: "m1".to_string(),
            content: "again".to_string(),
        });
        assert!(matches!(
            next_event(&mut f.events).await.event,
            StreamEvent::TextMessage { content, .. } if content == "again"
        ));
    }

    #[tokio::test]
    async fn duplicate_start_reports_error() {
        let mut f = fixture();
        f.connection.handle(start("c1")).await;

        let replies = f.connection.handle(start("c1")).await;
        assert!(matches!(
            &replies[..],
            [ServerMessage::Error { conversation_id: Some(id), .. }] if id == "c1"
        ));
    }

    #[tokio::test]
    async fn subscribe_to_unknown_stream() {
        let mut f = fixture();
        let replies = f
            .connection
            .handle(ClientAction::Subscribe {
                conversation_id: "nope".to_string(),
            })
            .await;
        assert!(matches!(&replies[..], [ServerMessage::Error { .. }]));
        assert!(!f.connection.is_subscribed("nope"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let mut f = fixture();
        f.connection.handle(start("c1")).await;
        f.connection
            .handle(ClientAction::Unsubscribe {
                conversation_id: "c1".to_string(),
            })
            .await;
        assert!(!f.connection.is_subscribed("c1"));

        let replies = f
            .connection
            .handle(ClientAction::SetMode {
                conversation_id: "c1".to_string(),
                mode: switchboard_core::StreamMode::Plan,
            })
            .await;
        assert!(replies.is_empty());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn status_and_full_state() {
        let mut f = fixture();
        f.connection.handle(start("c1")).await;
        f.connection
            .handle(ClientAction::Unsubscribe {
                conversation_id: "c1".to_string(),
            })
            .await;

        let replies = f.connection.handle(ClientAction::Status).await;
        assert_eq!(
            replies,
            vec![ServerMessage::Status {
                active_stream_ids: vec!["c1".to_string()]
            }]
        );

        let replies = f.connection.handle(ClientAction::FullState).await;
        assert!(matches!(&replies[0], ServerMessage::FullState(state) if state.active_streams.len() == 1));
        assert_eq!(
            replies[1],
            ServerMessage::Subscribed {
                conversation_id: "c1".to_string()
            }
        );
        assert!(f.connection.is_subscribed("c1"));
    }

    #[tokio::test]
    async fn abort_and_unknown_answers() {
        let mut f = fixture();
        f.connection.handle(start("c1")).await;

        let replies = f
            .connection
            .handle(ClientAction::AnswerUserInput {
                conversation_id: "c1".to_string(),
                request_id: "missing".to_string(),
                answer: "x".to_string(),
                was_freeform: true,
            })
            .await;
        assert!(matches!(&replies[..], [ServerMessage::Error { .. }]));

        let replies = f
            .connection
            .handle(ClientAction::Abort {
                conversation_id: "c1".to_string(),
            })
            .await;
        assert!(replies.is_empty());

        let message = next_event(&mut f.events).await;
        assert!(matches!(message.event, StreamEvent::Idle { .. }));

        let replies = f
            .connection
            .handle(ClientAction::Abort {
                conversation_id: "c1".to_string(),
            })
            .await;
        assert!(matches!(&replies[..], [ServerMessage::Error { .. }]));
    }
}
