//! Event dispatcher: a total function from record tag to handler.
//!
//! Dispatch is synchronous. Each record mutates the document before the
//! next one is read, and the matching [`DocumentEvent`] is emitted right
//! after the mutation. Terminal records return [`Flow::Terminal`]; the
//! engine applies the terminal state in one place.

use chrono::{DateTime, Utc};
use nimbus_core::records::{ToolCallStart, error_message, value_to_text};
use nimbus_core::{ConversationId, Envelope, Record};
use tracing::{debug, info, trace, warn};

use crate::document::{Document, StatusHint, ToolFinish, ToolOutcome, ToolStart};
use crate::emitter::{DocumentEvent, EventEmitter};
use crate::guard::PendingAccounting;
use crate::identity::{self, ConversationStore, Rekey};
use crate::turn::{Turn, TurnContext, TurnOutcome};

/// Message used when `complete{success:false}` carries no error.
pub const NO_RESPONSE_MESSAGE: &str = "server returned no response";

/// Message used when an `error` record carries no text.
pub const UNKNOWN_ERROR_MESSAGE: &str = "server reported an error";

/// Keyed stores mutated by the dispatch path.
#[derive(Debug, Default)]
pub struct EngineState {
    /// Conversations and their documents.
    pub store: ConversationStore,
    /// Token accounting awaiting its document.
    pub pending: PendingAccounting,
}

/// What the read loop does after a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Stop with this outcome.
    Terminal(TurnOutcome),
}

/// Dispatch one record into the turn's document.
pub fn dispatch(
    state: &mut EngineState,
    ctx: &mut TurnContext,
    emitter: &EventEmitter,
    envelope: Envelope,
) -> Flow {
    let at = envelope.timestamp.unwrap_or_else(Utc::now);
    let record = envelope.record;

    if let Some(reason) = stale_reason(&ctx.turn, &record) {
        warn!(
            turn_id = %ctx.turn.turn_id,
            tag = record.tag(),
            reason,
            "stale record rejected"
        );
        return Flow::Continue;
    }
    trace!(turn_id = %ctx.turn.turn_id, tag = record.tag(), "dispatching record");

    let turn_id = ctx.turn.turn_id.clone();
    match record {
        Record::MessageStart { .. } => {
            document(state, &ctx.turn).begin_streaming();
        }

        Record::MessageComplete { .. } => {
            if let Some(usage) = state.pending.drain(&turn_id) {
                debug!(%turn_id, "applying pending token usage");
                document(state, &ctx.turn).apply_token_usage(usage.clone());
                let _ = emitter.emit(DocumentEvent::TokenUsageApplied { turn_id, usage });
            }
        }

        Record::SessionCreated { session_id, .. } => {
            let rekey = identity::on_session_created(
                &mut state.store,
                &mut ctx.turn,
                ConversationId::from(session_id),
            );
            emit_rekey(emitter, rekey);
        }

        Record::SessionRenewed {
            old_session_id,
            new_session_id,
            reason,
            ..
        } => {
            let rekey = identity::on_session_renewed(
                &mut state.store,
                &mut ctx.turn,
                ConversationId::from(old_session_id),
                ConversationId::from(new_session_id),
                reason.as_deref(),
            );
            emit_rekey(emitter, rekey);
        }

        Record::ThinkingStart => {
            if document(state, &ctx.turn).open_thinking() {
                let _ = emitter.emit(DocumentEvent::ThinkingUpdated {
                    turn_id,
                    step: None,
                });
            }
        }

        Record::ThinkingStep { content } | Record::Thinking { content } => {
            if document(state, &ctx.turn).push_thinking_step(&content) {
                let _ = emitter.emit(DocumentEvent::ThinkingUpdated {
                    turn_id,
                    step: Some(content),
                });
            }
        }

        Record::ThinkingEnd { duration } => {
            if document(state, &ctx.turn).close_thinking(duration) {
                let _ = emitter.emit(DocumentEvent::ThinkingUpdated {
                    turn_id,
                    step: None,
                });
            }
        }

        Record::ToolCallStart(start) => tool_start(state, ctx, emitter, start, at),

        Record::ToolCallResult {
            tool_use_id,
            result,
            status,
        } => {
            let text = value_to_text(&result);
            let outcome = if status.as_deref() == Some("error") {
                ToolOutcome::Error(text)
            } else {
                ToolOutcome::Success(text)
            };
            tool_finish(state, &ctx.turn, emitter, tool_use_id, outcome, at);
        }

        Record::ToolCallError { tool_use_id, error } => {
            let outcome = ToolOutcome::Error(value_to_text(&error));
            tool_finish(state, &ctx.turn, emitter, tool_use_id, outcome, at);
        }

        Record::ContentDelta { delta, .. } | Record::Chunk { content: delta, .. } => {
            if document(state, &ctx.turn).append_text(&delta) {
                let _ = emitter.emit(DocumentEvent::TextAppended { turn_id, delta });
            }
        }

        Record::Response { content, .. } => {
            if document(state, &ctx.turn).replace_text(&content) {
                let _ = emitter.emit(DocumentEvent::TextReplaced { turn_id, content });
            }
        }

        Record::Status(update) => {
            let hint = StatusHint {
                status_type: update.status_type,
                message: update.message,
                estimated_seconds: update.estimated_seconds,
                details: update.details,
            };
            if document(state, &ctx.turn).set_status_hint(hint.clone()) {
                let _ = emitter.emit(DocumentEvent::StatusHint { turn_id, hint });
            }
        }

        Record::TokenUsage { usage, .. } => {
            if let Some(doc) = state.store.document_mut(&ctx.turn.conversation_id, &turn_id) {
                doc.apply_token_usage(usage.clone());
                let _ = emitter.emit(DocumentEvent::TokenUsageApplied { turn_id, usage });
            } else {
                debug!(%turn_id, "token usage arrived before its document, stashing");
                state.pending.stash(&turn_id, usage);
            }
        }

        Record::Complete(completion) => {
            if let Some(usage) = completion.token_usage {
                document(state, &ctx.turn).apply_token_usage(usage.clone());
                let _ = emitter.emit(DocumentEvent::TokenUsageApplied {
                    turn_id,
                    usage,
                });
            }
            let outcome = if completion.success {
                TurnOutcome::Completed
            } else {
                TurnOutcome::Failed {
                    message: completion
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| NO_RESPONSE_MESSAGE.to_owned()),
                }
            };
            return Flow::Terminal(outcome);
        }

        Record::Error { error, content, .. } => {
            let message =
                error_message(error, content).unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_owned());
            return Flow::Terminal(TurnOutcome::Failed { message });
        }

        Record::GenerationCancelled {
            reason, message, ..
        } => {
            info!(
                %turn_id,
                reason = reason.as_deref().unwrap_or("unspecified"),
                message = message.as_deref().unwrap_or(""),
                "server cancelled generation"
            );
            return Flow::Terminal(TurnOutcome::Cancelled);
        }

        Record::CancellationAcknowledged { .. } => {
            info!(%turn_id, "server acknowledged cancellation");
            return Flow::Terminal(TurnOutcome::Cancelled);
        }

        Record::Ping | Record::Pong => {}

        Record::Unknown { tag } => {
            debug!(%turn_id, tag = %tag, "ignoring unknown record");
        }
    }
    Flow::Continue
}

/// Why a record does not belong to this turn, if it does not.
///
/// `session_created` is exempt from the conversation check: a mismatch
/// there is an identity correction, not a stale record.
fn stale_reason(turn: &Turn, record: &Record) -> Option<&'static str> {
    if !matches!(record, Record::SessionCreated { .. }) {
        if let Some(session_id) = record.session_id() {
            if turn.conversation_id != session_id {
                return Some("conversation mismatch");
            }
        }
    }
    match record.query_id() {
        Some(query_id) if turn.turn_id != query_id => Some("turn mismatch"),
        _ => None,
    }
}

fn document<'a>(state: &'a mut EngineState, turn: &Turn) -> &'a mut Document {
    state.store.ensure_document(&turn.conversation_id, &turn.turn_id)
}

fn emit_rekey(emitter: &EventEmitter, rekey: Option<Rekey>) {
    if let Some(Rekey { from, to }) = rekey {
        let _ = emitter.emit(DocumentEvent::ConversationRekeyed { from, to });
    }
}

fn tool_start(
    state: &mut EngineState,
    ctx: &mut TurnContext,
    emitter: &EventEmitter,
    start: ToolCallStart,
    at: DateTime<Utc>,
) {
    let turn_id = ctx.turn.turn_id.clone();
    let ToolCallStart {
        tool_id,
        tool_name,
        description,
        args,
        update,
    } = start;

    if ctx.processed.admit(&tool_id) {
        match document(state, &ctx.turn).start_tool(&tool_id, &tool_name, args, description, at) {
            ToolStart::Inserted => {
                debug!(%turn_id, %tool_id, tool_name = %tool_name, "tool started");
                let _ = emitter.emit(DocumentEvent::ToolStarted {
                    turn_id,
                    tool_id,
                    name: tool_name,
                });
            }
            ToolStart::Duplicate => debug!(%turn_id, %tool_id, "tool already in document"),
            ToolStart::Ignored => debug!(%turn_id, %tool_id, "tool start after terminal state"),
        }
    } else if update {
        if document(state, &ctx.turn).update_tool_args(&tool_id, args) {
            debug!(%turn_id, %tool_id, "tool arguments updated");
            let _ = emitter.emit(DocumentEvent::ToolArgsUpdated { turn_id, tool_id });
        }
    } else {
        debug!(%turn_id, %tool_id, "duplicate tool start dropped");
    }
}

fn tool_finish(
    state: &mut EngineState,
    turn: &Turn,
    emitter: &EventEmitter,
    tool_id: String,
    outcome: ToolOutcome,
    at: DateTime<Utc>,
) {
    let turn_id = turn.turn_id.clone();
    match document(state, turn).finish_tool(&tool_id, outcome, at) {
        ToolFinish::Finished(status) => {
            let _ = emitter.emit(DocumentEvent::ToolFinished {
                turn_id,
                tool_id,
                status,
            });
        }
        ToolFinish::UnknownId => warn!(%turn_id, %tool_id, "result for unknown tool dropped"),
        ToolFinish::AlreadyFinished => debug!(%turn_id, %tool_id, "tool already finished"),
        ToolFinish::Ignored => debug!(%turn_id, %tool_id, "tool result after terminal state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use nimbus_core::logging::capture_logs;
    use nimbus_core::{TokenUsage, TurnId};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::document::{DocumentStatus, Segment, ToolStatus};

    fn ctx(conversation: &str) -> TurnContext {
        TurnContext::new(Turn {
            turn_id: TurnId::from("query_1_aaaaaaaa"),
            conversation_id: ConversationId::from(conversation),
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        })
    }

    fn feed(state: &mut EngineState, ctx: &mut TurnContext, records: &[serde_json::Value]) -> Vec<Flow> {
        let emitter = EventEmitter::new();
        records
            .iter()
            .map(|value| {
                let record = Record::from_value(value.clone()).unwrap();
                dispatch(state, ctx, &emitter, Envelope::new(record))
            })
            .collect()
    }

    fn doc<'a>(state: &'a EngineState, ctx: &TurnContext) -> &'a Document {
        state
            .store
            .document(&ctx.turn.conversation_id, &ctx.turn.turn_id)
            .unwrap()
    }

    #[test]
    fn example_sequence_builds_ordered_segments() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let flows = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "message_start", "session_id": "A"}),
                json!({"type": "content_delta", "delta": "Hel"}),
                json!({"type": "content_delta", "delta": "lo"}),
                json!({"type": "tool_call_start", "tool_id": "1", "tool_name": "x"}),
                json!({"type": "tool_call_result", "tool_use_id": "1", "result": "ok"}),
                json!({"type": "content_delta", "delta": " world"}),
                json!({"type": "complete", "success": true}),
            ],
        );
        assert_eq!(flows.last(), Some(&Flow::Terminal(TurnOutcome::Completed)));
        let d = doc(&state, &ctx);
        assert_eq!(d.segments.len(), 3);
        assert_eq!(d.segments[0].as_text(), Some("Hello"));
        let tool = d.segments[1].as_tool().unwrap();
        assert_eq!(tool.status, ToolStatus::Success);
        assert_eq!(tool.result.as_deref(), Some("ok"));
        assert_eq!(d.segments[2].as_text(), Some(" world"));
        assert_eq!(d.flatten(), "Hello world");
    }

    #[test]
    fn duplicate_tool_start_and_update_variant() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "tool_call_start", "tool_id": "t1", "tool_name": "cost", "args": {}}),
                json!({"type": "tool_call_result", "tool_use_id": "t1", "result": {"total": 3}}),
                json!({"type": "tool_call_start", "tool_id": "t1", "tool_name": "cost", "args": {}}),
                json!({"type": "tool_call_start", "tool_id": "t1", "tool_name": "cost", "args": {"month": "may"}, "description": "late", "update": true}),
            ],
        );
        let d = doc(&state, &ctx);
        assert_eq!(d.segments.len(), 1);
        let tool = d.tool("t1").unwrap();
        assert_eq!(tool.status, ToolStatus::Success);
        assert_eq!(tool.result.as_deref(), Some(r#"{"total":3}"#));
        assert_eq!(tool.args, json!({"month": "may"}));
        assert!(tool.description.is_none());
    }

    #[test]
    fn result_with_error_status_and_tool_error() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "tool_call_start", "tool_id": "a", "tool_name": "x"}),
                json!({"type": "tool_call_start", "tool_id": "b", "tool_name": "y"}),
                json!({"type": "tool_call_result", "tool_use_id": "a", "result": "denied", "status": "error"}),
                json!({"type": "tool_call_error", "tool_use_id": "b", "error": {"code": 403}}),
            ],
        );
        let d = doc(&state, &ctx);
        assert_eq!(d.tool("a").unwrap().status, ToolStatus::Error);
        assert_eq!(d.tool("a").unwrap().error.as_deref(), Some("denied"));
        assert_eq!(d.tool("b").unwrap().error.as_deref(), Some(r#"{"code":403}"#));
    }

    #[test]
    fn result_for_unknown_tool_is_logged_noop() {
        let (logs, _guard) = capture_logs();
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let flows = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "content_delta", "delta": "x"}),
                json!({"type": "tool_call_result", "tool_use_id": "ghost", "result": "r"}),
            ],
        );
        assert!(flows.iter().all(|f| *f == Flow::Continue));
        assert_eq!(doc(&state, &ctx).segments.len(), 1);
        assert!(logs.has_event(tracing::Level::WARN, "unknown tool"));
    }

    #[test]
    fn early_token_usage_applied_on_message_complete() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[json!({"type": "token_usage", "query_id": "query_1_aaaaaaaa", "usage": {"input_tokens": 11, "output_tokens": 4}})],
        );
        assert!(state.pending.contains(&ctx.turn.turn_id));
        assert!(state.store.document(&ctx.turn.conversation_id, &ctx.turn.turn_id).is_none());

        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "message_start", "session_id": "A"}),
                json!({"type": "content_delta", "delta": "hi"}),
                json!({"type": "message_complete", "session_id": "A", "query_id": "query_1_aaaaaaaa"}),
            ],
        );
        assert!(state.pending.is_empty());
        assert_eq!(doc(&state, &ctx).token_usage.as_ref().map(TokenUsage::total), Some(15));
    }

    #[test]
    fn token_usage_with_document_applies_immediately() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "message_start"}),
                json!({"type": "token_usage", "usage": {"output_tokens": 9}}),
            ],
        );
        assert!(state.pending.is_empty());
        assert_eq!(doc(&state, &ctx).token_usage.as_ref().unwrap().output_tokens, 9);
    }

    #[test]
    fn stale_records_are_rejected() {
        let (logs, _guard) = capture_logs();
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let flows = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "chunk", "content": "ok"}),
                json!({"type": "chunk", "content": "other", "session_id": "Z"}),
                json!({"type": "error", "content": "old turn failed", "query_id": "query_0_bbbbbbbb"}),
            ],
        );
        assert!(flows.iter().all(|f| *f == Flow::Continue));
        assert_eq!(doc(&state, &ctx).flatten(), "ok");
        assert_eq!(logs.count_at_level(tracing::Level::WARN), 2);
    }

    #[test]
    fn renewal_keeps_building_the_same_document() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "message_start", "session_id": "A"}),
                json!({"type": "content_delta", "delta": "before "}),
                json!({"type": "session_renewed", "old_session_id": "A", "new_session_id": "B", "reason": "session_expired"}),
                json!({"type": "content_delta", "delta": "after", "session_id": "B"}),
            ],
        );
        assert_eq!(ctx.turn.conversation_id, ConversationId::from("B"));
        assert!(state.store.get(&ConversationId::from("A")).is_none());
        let d = doc(&state, &ctx);
        assert_eq!(d.segments.len(), 1);
        assert_eq!(d.flatten(), "before after");
    }

    #[test]
    fn session_created_with_new_id_rekeys() {
        let mut state = EngineState::default();
        let mut ctx = ctx("local");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "chunk", "content": "x"}),
                json!({"type": "session_created", "session_id": "server", "query_id": "query_1_aaaaaaaa"}),
                json!({"type": "chunk", "content": "y", "session_id": "server"}),
            ],
        );
        assert_eq!(doc(&state, &ctx).flatten(), "xy");
        assert_eq!(doc(&state, &ctx).conversation_id, ConversationId::from("server"));
    }

    #[test]
    fn terminal_records_map_to_outcomes() {
        let cases = [
            (json!({"type": "complete", "success": false}), TurnOutcome::Failed { message: NO_RESPONSE_MESSAGE.into() }),
            (json!({"type": "complete", "success": false, "error": "quota"}), TurnOutcome::Failed { message: "quota".into() }),
            (json!({"type": "error", "content": "boom"}), TurnOutcome::Failed { message: "boom".into() }),
            (json!({"type": "error"}), TurnOutcome::Failed { message: UNKNOWN_ERROR_MESSAGE.into() }),
            (json!({"type": "error", "error": "boom", "content": "Runtime error: boom"}), TurnOutcome::Failed { message: "boom".into() }),
            (json!({"type": "generation_cancelled", "reason": "user"}), TurnOutcome::Cancelled),
            (json!({"type": "cancellation_acknowledged"}), TurnOutcome::Cancelled),
        ];
        for (record, expected) in cases {
            let mut state = EngineState::default();
            let mut ctx = ctx("A");
            let flows = feed(&mut state, &mut ctx, &[record]);
            assert_eq!(flows, vec![Flow::Terminal(expected)]);
        }
    }

    #[test]
    fn unknown_tag_is_ignored_without_document() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let flows = feed(&mut state, &mut ctx, &[json!({"type": "brand_new_thing"})]);
        assert_eq!(flows, vec![Flow::Continue]);
        assert!(state.store.is_empty());
    }

    #[test]
    fn thinking_and_status_channels() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "thinking", "content": "legacy narration"}),
                json!({"type": "thinking_step", "content": "step two"}),
                json!({"type": "thinking_end", "duration": 1.25}),
                json!({"type": "status", "status_type": "querying", "message": "Fetching", "estimated_seconds": 4.0}),
            ],
        );
        let d = doc(&state, &ctx);
        let trace = d.thinking.as_ref().unwrap();
        assert_eq!(trace.steps, vec!["legacy narration", "step two"]);
        assert_eq!(trace.duration, Some(1.25));
        assert_eq!(d.status_hint.as_ref().unwrap().status_type, "querying");
        assert_eq!(d.status, DocumentStatus::Streaming);
        assert_matches!(d.segments.as_slice(), []);
    }

    #[test]
    fn response_after_deltas_replaces_text() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let _ = feed(
            &mut state,
            &mut ctx,
            &[
                json!({"type": "content_delta", "delta": "dra"}),
                json!({"type": "tool_call_start", "tool_id": "t", "tool_name": "x"}),
                json!({"type": "content_delta", "delta": "ft"}),
                json!({"type": "response", "content": "Final."}),
            ],
        );
        let d = doc(&state, &ctx);
        assert_matches!(d.segments.as_slice(), [Segment::Tool(_), Segment::Text { content }] if content == "Final.");
    }

    #[tokio::test]
    async fn events_follow_mutations_in_order() {
        let mut state = EngineState::default();
        let mut ctx = ctx("A");
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        for value in [
            json!({"type": "content_delta", "delta": "a"}),
            json!({"type": "tool_call_start", "tool_id": "t", "tool_name": "x"}),
            json!({"type": "tool_call_result", "tool_use_id": "t", "result": "r"}),
        ] {
            let record = Record::from_value(value).unwrap();
            let _ = dispatch(&mut state, &mut ctx, &emitter, Envelope::new(record));
        }
        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.kind())
            .collect();
        assert_eq!(kinds, vec!["text_appended", "tool_started", "tool_finished"]);
    }
}
