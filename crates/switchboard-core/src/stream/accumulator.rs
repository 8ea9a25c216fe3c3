//! Folds raw engine events into the turn buffer and normalized stream events.

use std::collections::HashSet;

use super::accumulation::{Accumulation, TokenUsage};
use super::event::StreamEvent;
use crate::engine::event::{EngineEvent, PREMIUM_REQUESTS};
use crate::quota::{QuotaCache, QuotaInfo};

/// Ids already applied to this stream. They are never cleared while the
/// stream lives, so redelivered events are dropped even across turns.
#[derive(Debug, Default)]
pub struct SeenIds {
    pub messages: HashSet<String>,
    pub tool_calls: HashSet<String>,
    pub reasoning: HashSet<String>,
}

/// What the stream should do with one engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Broadcast this event.
    Forward(StreamEvent),
    /// Duplicate or irrelevant. Nothing to broadcast.
    Dropped,
    /// The session finished its turn.
    Idle,
    /// The session reported an error.
    Failed(String),
}

#[derive(Debug, Default)]
pub struct Accumulator {
    pub accumulation: Accumulation,
    pub seen: SeenIds,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, event: EngineEvent, quota: &QuotaCache) -> Ingested {
        match event {
            EngineEvent::TextDelta { message_id, delta } => {
                self.accumulation.append_delta(&delta);
                Ingested::Forward(StreamEvent::TextDelta { message_id, delta })
            }

            EngineEvent::TextMessage {
                message_id,
                content,
            } => {
                if !self.seen.messages.insert(message_id.clone()) {
                    return Ingested::Dropped;
                }
                self.accumulation.push_text(content.clone());
                Ingested::Forward(StreamEvent::TextMessage {
                    message_id,
                    content,
                })
            }

            EngineEvent::ToolStart {
                tool_call_id,
                tool_name,
                arguments,
            } => {
                if !self.seen.tool_calls.insert(tool_call_id.clone()) {
                    return Ingested::Dropped;
                }
                self.accumulation.start_tool(
                    tool_call_id.clone(),
                    tool_name.clone(),
                    arguments.clone(),
                );
                Ingested::Forward(StreamEvent::ToolStart {
                    tool_call_id,
                    tool_name,
                    arguments,
                })
            }

            EngineEvent::ToolEnd {
                tool_call_id,
                success,
                result,
                error,
            } => {
                let error = error.as_ref().map(normalize_error);
                match self
                    .accumulation
                    .finish_tool(&tool_call_id, success, result, error)
                {
                    Some(record) => Ingested::Forward(StreamEvent::ToolEnd {
                        tool_call_id: record.tool_call_id,
                        tool_name: record.tool_name,
                        status: record.status,
                        result: record.result,
                        error: record.error,
                    }),
                    None => {
                        log::debug!("Dropping tool end for unknown call {}", tool_call_id);
                        Ingested::Dropped
                    }
                }
            }

            EngineEvent::ReasoningDelta { delta_id, delta } => {
                if let Some(id) = &delta_id {
                    if !self.seen.reasoning.insert(id.clone()) {
                        return Ingested::Dropped;
                    }
                }
                self.accumulation.append_reasoning(&delta);
                Ingested::Forward(StreamEvent::ReasoningDelta { delta_id, delta })
            }

            EngineEvent::ReasoningComplete {
                reasoning_id,
                content,
            } => {
                if !self.seen.reasoning.insert(reasoning_id.clone()) {
                    return Ingested::Dropped;
                }
                self.accumulation.complete_reasoning(&content);
                Ingested::Forward(StreamEvent::ReasoningComplete {
                    reasoning_id,
                    content,
                })
            }

            EngineEvent::Usage {
                input_tokens,
                output_tokens,
                cache_read_tokens,
                cache_write_tokens,
            } => {
                self.accumulation.add_usage(TokenUsage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                });
                Ingested::Forward(StreamEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                })
            }

            EngineEvent::Quota { snapshots } => match snapshots.get(PREMIUM_REQUESTS) {
                Some(snapshot) => {
                    let info = QuotaInfo::from_snapshot(snapshot);
                    quota.store(info.clone());
                    Ingested::Forward(StreamEvent::Quota(info))
                }
                None => Ingested::Dropped,
            },

            EngineEvent::Idle => Ingested::Idle,

            EngineEvent::Error { message } => Ingested::Failed(message),
        }
    }

    /// Hand back the finished turn. Dedup state is kept.
    pub fn take_turn(&mut self) -> Accumulation {
        self.accumulation.take()
    }
}

/// Reduce an engine error value to display text: strings pass through,
/// objects contribute their `message`, anything else becomes its JSON text.
pub fn normalize_error(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => match other.get("message").and_then(|m| m.as_str()) {
            Some(message) => message.to_string(),
            None => other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::event::QuotaSnapshot;
    use crate::stream::accumulation::{ToolStatus, TurnSegment};
    use serde_json::json;
    use std::collections::HashMap;

    fn text(id: &str, content: &str) -> EngineEvent {
        EngineEvent::TextMessage {
            message_id: id.to_string(),
            content: content.to_string(),
        }
    }

    fn tool_start(id: &str) -> EngineEvent {
        EngineEvent::ToolStart {
            tool_call_id: id.to_string(),
            tool_name: "view".to_string(),
            arguments: json!({"path": "README.md"}),
        }
    }

    fn tool_end(id: &str, success: bool, error: Option<serde_json::Value>) -> EngineEvent {
        EngineEvent::ToolEnd {
            tool_call_id: id.to_string(),
            success,
            result: None,
            error,
        }
    }

    mod dedup {
        use super::*;

        #[test]
        fn duplicate_message_id_is_dropped() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();

            assert!(matches!(
                acc.ingest(text("m1", "Hello"), &quota),
                Ingested::Forward(_)
            ));
            assert_eq!(acc.ingest(text("m1", "Hello"), &quota), Ingested::Dropped);
            assert_eq!(acc.accumulation.text_segments, vec!["Hello".to_string()]);
        }

        #[test]
        fn duplicate_tool_start_is_dropped() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();

            acc.ingest(tool_start("t1"), &quota);
            assert_eq!(acc.ingest(tool_start("t1"), &quota), Ingested::Dropped);
            assert_eq!(acc.accumulation.tool_records.len(), 1);
        }

        #[test]
        fn duplicate_reasoning_is_dropped() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();
            let complete = EngineEvent::ReasoningComplete {
                reasoning_id: "r1".to_string(),
                content: "why".to_string(),
            };

            acc.ingest(complete.clone(), &quota);
            assert_eq!(acc.ingest(complete, &quota), Ingested::Dropped);
        }

        #[test]
        fn reasoning_delta_dedup_only_with_id() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();
            let anonymous = EngineEvent::ReasoningDelta {
                delta_id: None,
                delta: "a".to_string(),
            };
            let identified = EngineEvent::ReasoningDelta {
                delta_id: Some("d1".to_string()),
                delta: "b".to_string(),
            };

            acc.ingest(anonymous.clone(), &quota);
            acc.ingest(anonymous, &quota);
            acc.ingest(identified.clone(), &quota);
            assert_eq!(acc.ingest(identified, &quota), Ingested::Dropped);
            assert_eq!(acc.accumulation.reasoning, "aab");
        }

        #[test]
        fn seen_ids_survive_take_turn() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();

            acc.ingest(text("m1", "Hello"), &quota);
            acc.take_turn();
            assert_eq!(acc.ingest(text("m1", "Hello"), &quota), Ingested::Dropped);
            assert!(!acc.accumulation.has_content());
        }

        #[test]
        fn text_deltas_are_never_deduped() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();
            let delta = EngineEvent::TextDelta {
                message_id: Some("m1".to_string()),
                delta: "He".to_string(),
            };

            acc.ingest(delta.clone(), &quota);
            assert!(matches!(acc.ingest(delta, &quota), Ingested::Forward(_)));
            assert_eq!(acc.accumulation.streaming_text, "HeHe");
            assert!(acc.accumulation.text_segments.is_empty());
        }
    }

    mod tool_end {
        use super::*;

        #[test]
        fn without_start_is_dropped() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();

            assert_eq!(
                acc.ingest(tool_end("ghost", true, None), &quota),
                Ingested::Dropped
            );
        }

        #[test]
        fn carries_tool_name_from_start() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();

            acc.ingest(tool_start("t1"), &quota);
            match acc.ingest(tool_end("t1", true, None), &quota) {
                Ingested::Forward(StreamEvent::ToolEnd {
                    tool_name, status, ..
                }) => {
                    assert_eq!(tool_name, "view");
                    assert_eq!(status, ToolStatus::Success);
                }
                other => panic!("Expected ToolEnd, got {:?}", other),
            }
        }

        #[test]
        fn error_object_is_normalized() {
            let quota = QuotaCache::new();
            let mut acc = Accumulator::new();

            acc.ingest(tool_start("t1"), &quota);
            acc.ingest(
                tool_end("t1", false, Some(json!({"message": "permission denied"}))),
                &quota,
            );

            let record = &acc.accumulation.tool_records[0];
            assert_eq!(record.status, ToolStatus::Error);
            assert_eq!(record.error.as_deref(), Some("permission denied"));
            assert!(matches!(
                &acc.accumulation.turn_segments[0],
                TurnSegment::Tool(r) if r.status == ToolStatus::Error
            ));
        }
    }

    mod normalize {
        use super::*;

        #[test]
        fn string_passthrough() {
            assert_eq!(normalize_error(&json!("boom")), "boom");
        }

        #[test]
        fn object_message() {
            assert_eq!(normalize_error(&json!({"message": "bad", "code": 1})), "bad");
        }

        #[test]
        fn fallback_to_json_text() {
            assert_eq!(normalize_error(&json!({"code": 1})), r#"{"code":1}"#);
            assert_eq!(normalize_error(&json!(42)), "42");
        }
    }

    mod quota {
        use super::*;

        fn quota_event(key: &str, entitlement: u64) -> EngineEvent {
            let mut snapshots = HashMap::new();
            snapshots.insert(
                key.to_string(),
                QuotaSnapshot {
                    used_requests: 3,
                    entitlement_requests: entitlement,
                    reset_date: None,
                },
            );
            EngineEvent::Quota { snapshots }
        }

        #[test]
        fn premium_snapshot_updates_cache() {
            let cache = QuotaCache::new();
            let mut acc = Accumulator::new();

            let outcome = acc.ingest(quota_event(PREMIUM_REQUESTS, 0), &cache);

            assert!(matches!(outcome, Ingested::Forward(StreamEvent::Quota(_))));
            let latest = cache.latest().unwrap();
            assert!(latest.unlimited);
            assert_eq!(latest.used, 3);
        }

        #[test]
        fn other_buckets_are_ignored() {
            let cache = QuotaCache::new();
            let mut acc = Accumulator::new();

            assert_eq!(
                acc.ingest(quota_event("chat", 100), &cache),
                Ingested::Dropped
            );
            assert!(cache.latest().is_none());
        }
    }

    #[test]
    fn idle_and_error_are_control_outcomes() {
        let quota = QuotaCache::new();
        let mut acc = Accumulator::new();

        assert_eq!(acc.ingest(EngineEvent::Idle, &quota), Ingested::Idle);
        assert_eq!(
            acc.ingest(
                EngineEvent::Error {
                    message: "crashed".to_string()
                },
                &quota
            ),
            Ingested::Failed("crashed".to_string())
        );
    }
}
