//! The assistant message under construction for one turn.
//!
//! A [`Document`] is an arrival-ordered list of [`Segment`]s plus auxiliary
//! channels (thinking trace, status hint, token accounting). Two adjacent
//! text segments never coexist: a delta either extends the trailing text
//! segment or starts a new one after a tool invocation.
//!
//! Terminal states are sticky. Once completed, failed or cancelled, content
//! mutators return `false` and leave the document untouched; token
//! accounting is still absorbed.

use chrono::{DateTime, Utc};
use nimbus_core::{ConversationId, MessageId, TokenUsage, TurnId};
use serde::Serialize;
use serde_json::Value;

/// Lifecycle of a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Created, no content record seen yet.
    Pending,
    /// Receiving records.
    Streaming,
    /// Finished successfully.
    Completed,
    /// Finished with a transport or domain failure.
    Failed,
    /// Stopped by the user or by teardown.
    Cancelled,
}

impl DocumentStatus {
    /// Whether no further content mutation is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Wire-style name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Status of one tool invocation. Moves only from `Calling`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Running.
    Calling,
    /// Produced a result.
    Success,
    /// Failed.
    Error,
}

/// One tool invocation segment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolInvocation {
    /// Invocation id, unique within the turn.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments (replaced by late full-argument updates).
    pub args: Value,
    /// Human-readable description.
    pub description: Option<String>,
    /// Current status.
    pub status: ToolStatus,
    /// Result text on success.
    pub result: Option<String>,
    /// Error text on failure.
    pub error: Option<String>,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    pub ended_at: Option<DateTime<Utc>>,
    /// `ended_at - started_at` in seconds.
    pub duration_seconds: Option<f64>,
}

/// One ordered unit of a document.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    /// A run of text.
    Text {
        /// Accumulated text.
        content: String,
    },
    /// A tool invocation.
    Tool(ToolInvocation),
}

impl Segment {
    /// Text content, if this is a text segment.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            Self::Tool(_) => None,
        }
    }

    /// Tool invocation, if this is a tool segment.
    pub fn as_tool(&self) -> Option<&ToolInvocation> {
        match self {
            Self::Tool(tool) => Some(tool),
            Self::Text { .. } => None,
        }
    }
}

/// Thinking trace: ordered narration steps plus total duration.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ThinkingTrace {
    /// Steps in arrival order.
    pub steps: Vec<String>,
    /// Total duration in seconds, set by `thinking_end`.
    pub duration: Option<f64>,
}

/// Transient presentation hint from a `status` record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusHint {
    /// Status kind.
    pub status_type: String,
    /// Display message.
    pub message: Option<String>,
    /// Estimated remaining seconds.
    pub estimated_seconds: Option<f64>,
    /// Free-form details.
    pub details: Option<Value>,
}

/// Result of [`Document::start_tool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolStart {
    /// A new invocation segment was pushed.
    Inserted,
    /// The id already exists; nothing changed.
    Duplicate,
    /// The document is terminal.
    Ignored,
}

/// How a tool invocation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    /// Result text.
    Success(String),
    /// Error text.
    Error(String),
}

/// Result of [`Document::finish_tool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolFinish {
    /// The invocation moved to a final status.
    Finished(ToolStatus),
    /// No invocation with that id.
    UnknownId,
    /// The invocation had already finished.
    AlreadyFinished,
    /// The document is terminal.
    Ignored,
}

/// The assistant message under construction for one turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Document {
    /// Owning turn.
    pub turn_id: TurnId,
    /// Message id.
    pub message_id: MessageId,
    /// Owning conversation (rewritten on re-key).
    pub conversation_id: ConversationId,
    /// Arrival-ordered segments.
    pub segments: Vec<Segment>,
    /// Thinking trace, once opened.
    pub thinking: Option<ThinkingTrace>,
    /// Lifecycle status.
    pub status: DocumentStatus,
    /// Token accounting.
    pub token_usage: Option<TokenUsage>,
    /// Failure message.
    pub error: Option<String>,
    /// Current status hint.
    pub status_hint: Option<StatusHint>,
    /// Restored from an interruption record.
    pub interrupted: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Create an empty pending document.
    pub fn new(turn_id: TurnId, conversation_id: ConversationId) -> Self {
        Self {
            turn_id,
            message_id: MessageId::generate(),
            conversation_id,
            segments: Vec::new(),
            thinking: None,
            status: DocumentStatus::Pending,
            token_usage: None,
            error: None,
            status_hint: None,
            interrupted: false,
            created_at: Utc::now(),
        }
    }

    /// Rebuild a cancelled document from persisted text.
    pub fn restored(
        turn_id: TurnId,
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    ) -> Self {
        let mut doc = Self::new(turn_id, conversation_id);
        doc.message_id = message_id;
        if !content.is_empty() {
            doc.segments.push(Segment::Text { content });
        }
        doc.status = DocumentStatus::Cancelled;
        doc.interrupted = true;
        doc
    }

    /// Whether the document reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move from pending to streaming.
    pub fn begin_streaming(&mut self) {
        if self.status == DocumentStatus::Pending {
            self.status = DocumentStatus::Streaming;
        }
    }

    /// Append a text delta to the trailing text segment, or start one.
    pub fn append_text(&mut self, delta: &str) -> bool {
        if self.is_terminal() || delta.is_empty() {
            return false;
        }
        self.begin_streaming();
        if let Some(Segment::Text { content }) = self.segments.last_mut() {
            content.push_str(delta);
        } else {
            self.segments.push(Segment::Text {
                content: delta.to_owned(),
            });
        }
        true
    }

    /// Replace all text with `content`.
    ///
    /// Every text segment is removed and a single one is appended after the
    /// tool invocations, which keep their relative order.
    pub fn replace_text(&mut self, content: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.begin_streaming();
        self.segments.retain(|segment| segment.as_tool().is_some());
        if !content.is_empty() {
            self.segments.push(Segment::Text {
                content: content.to_owned(),
            });
        }
        true
    }

    /// Push a new tool invocation in `calling` state.
    pub fn start_tool(
        &mut self,
        id: &str,
        name: &str,
        args: Value,
        description: Option<String>,
        at: DateTime<Utc>,
    ) -> ToolStart {
        if self.is_terminal() {
            return ToolStart::Ignored;
        }
        if self.tool(id).is_some() {
            return ToolStart::Duplicate;
        }
        self.begin_streaming();
        self.segments.push(Segment::Tool(ToolInvocation {
            id: id.to_owned(),
            name: name.to_owned(),
            args,
            description,
            status: ToolStatus::Calling,
            result: None,
            error: None,
            started_at: at,
            ended_at: None,
            duration_seconds: None,
        }));
        ToolStart::Inserted
    }

    /// Replace the arguments of a known invocation in place. Nothing else changes.
    pub fn update_tool_args(&mut self, id: &str, args: Value) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(tool) = self.tool_mut(id) else {
            return false;
        };
        tool.args = args;
        true
    }

    /// Move a `calling` invocation to its final status.
    pub fn finish_tool(&mut self, id: &str, outcome: ToolOutcome, at: DateTime<Utc>) -> ToolFinish {
        if self.is_terminal() {
            return ToolFinish::Ignored;
        }
        let Some(tool) = self.tool_mut(id) else {
            return ToolFinish::UnknownId;
        };
        if tool.status != ToolStatus::Calling {
            return ToolFinish::AlreadyFinished;
        }

        match outcome {
            ToolOutcome::Success(result) => {
                tool.status = ToolStatus::Success;
                tool.result = Some(result);
            }
            ToolOutcome::Error(error) => {
                tool.status = ToolStatus::Error;
                tool.error = Some(error);
            }
        }
        tool.ended_at = Some(at);
        #[allow(clippy::cast_precision_loss)]
        let seconds = (at - tool.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        tool.duration_seconds = Some(seconds);
        ToolFinish::Finished(tool.status)
    }

    /// Open an empty thinking trace (resets a previous one).
    pub fn open_thinking(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.begin_streaming();
        self.thinking = Some(ThinkingTrace::default());
        true
    }

    /// Append a thinking step, opening the trace if needed.
    pub fn push_thinking_step(&mut self, content: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.begin_streaming();
        self.thinking
            .get_or_insert_with(ThinkingTrace::default)
            .steps
            .push(content.to_owned());
        true
    }

    /// Record the total thinking duration.
    pub fn close_thinking(&mut self, duration: Option<f64>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let trace = self.thinking.get_or_insert_with(ThinkingTrace::default);
        trace.duration = duration;
        true
    }

    /// Overwrite the transient status hint.
    pub fn set_status_hint(&mut self, hint: StatusHint) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status_hint = Some(hint);
        true
    }

    /// Set token accounting. Allowed in every state.
    pub fn apply_token_usage(&mut self, usage: TokenUsage) {
        self.token_usage = Some(usage);
    }

    /// Reach `completed`.
    pub fn complete(&mut self) -> bool {
        self.terminate(DocumentStatus::Completed, None)
    }

    /// Reach `failed` with a user-visible message.
    pub fn fail(&mut self, message: &str) -> bool {
        self.terminate(DocumentStatus::Failed, Some(message.to_owned()))
    }

    /// Reach `cancelled`.
    pub fn cancel(&mut self) -> bool {
        self.terminate(DocumentStatus::Cancelled, None)
    }

    fn terminate(&mut self, status: DocumentStatus, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.status_hint = None;
        true
    }

    /// Concatenated text of all text segments, in order.
    pub fn flatten(&self) -> String {
        self.segments.iter().filter_map(Segment::as_text).collect()
    }

    /// Look up a tool invocation by id.
    pub fn tool(&self, id: &str) -> Option<&ToolInvocation> {
        self.segments
            .iter()
            .filter_map(Segment::as_tool)
            .find(|tool| tool.id == id)
    }

    fn tool_mut(&mut self, id: &str) -> Option<&mut ToolInvocation> {
        self.segments.iter_mut().find_map(|segment| match segment {
            Segment::Tool(tool) if tool.id == id => Some(tool),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc() -> Document {
        Document::new(TurnId::from("query_1_aaaaaaaa"), ConversationId::from("c1"))
    }

    fn no_adjacent_text(doc: &Document) -> bool {
        doc.segments
            .windows(2)
            .all(|pair| !(pair[0].as_text().is_some() && pair[1].as_text().is_some()))
    }

    #[test]
    fn deltas_merge_into_one_segment() {
        let mut d = doc();
        assert!(d.append_text("Hel"));
        assert!(d.append_text("lo"));
        assert_eq!(d.segments.len(), 1);
        assert_eq!(d.flatten(), "Hello");
        assert_eq!(d.status, DocumentStatus::Streaming);
    }

    #[test]
    fn tool_breaks_text_run() {
        let mut d = doc();
        let _ = d.append_text("a");
        let _ = d.start_tool("t1", "cost", json!({}), None, Utc::now());
        let _ = d.append_text("b");
        assert_eq!(d.segments.len(), 3);
        assert_eq!(d.segments[2].as_text(), Some("b"));
    }

    #[test]
    fn duplicate_tool_start_is_idempotent() {
        let mut d = doc();
        let at = Utc::now();
        assert_eq!(d.start_tool("t1", "x", json!({}), None, at), ToolStart::Inserted);
        let _ = d.finish_tool("t1", ToolOutcome::Success("ok".into()), at);
        assert_eq!(d.start_tool("t1", "x", json!({}), None, at), ToolStart::Duplicate);
        assert_eq!(d.segments.len(), 1);
        assert_eq!(d.tool("t1").unwrap().status, ToolStatus::Success);
    }

    #[test]
    fn args_update_keeps_position() {
        let mut d = doc();
        let _ = d.start_tool("t1", "x", json!({"partial": true}), Some("first".into()), Utc::now());
        let _ = d.append_text("after");
        assert!(d.update_tool_args("t1", json!({"full": 1})));
        let tool = d.segments[0].as_tool().unwrap();
        assert_eq!(tool.args, json!({"full": 1}));
        assert_eq!(tool.description.as_deref(), Some("first"));
        assert_eq!(tool.status, ToolStatus::Calling);
        assert_eq!(d.segments[1].as_text(), Some("after"));
        assert!(!d.update_tool_args("missing", json!({})));
    }

    #[test]
    fn finish_unknown_tool_is_noop() {
        let mut d = doc();
        let _ = d.append_text("x");
        assert_eq!(
            d.finish_tool("nope", ToolOutcome::Error("e".into()), Utc::now()),
            ToolFinish::UnknownId
        );
        assert_eq!(d.segments.len(), 1);
    }

    #[test]
    fn finish_sets_duration_and_blocks_second_transition() {
        let mut d = doc();
        let start = Utc::now();
        let _ = d.start_tool("t1", "x", json!({}), None, start);
        let end = start + chrono::Duration::milliseconds(1500);
        assert_eq!(
            d.finish_tool("t1", ToolOutcome::Error("denied".into()), end),
            ToolFinish::Finished(ToolStatus::Error)
        );
        let tool = d.tool("t1").unwrap();
        assert_eq!(tool.duration_seconds, Some(1.5));
        assert_eq!(tool.error.as_deref(), Some("denied"));
        assert_eq!(
            d.finish_tool("t1", ToolOutcome::Success("late".into()), end),
            ToolFinish::AlreadyFinished
        );
        assert_eq!(d.tool("t1").unwrap().status, ToolStatus::Error);
    }

    #[test]
    fn replace_collapses_text_after_tools() {
        let mut d = doc();
        let _ = d.append_text("draft ");
        let _ = d.start_tool("t1", "x", json!({}), None, Utc::now());
        let _ = d.append_text("more");
        assert!(d.replace_text("final answer"));
        assert_eq!(d.segments.len(), 2);
        assert!(d.segments[0].as_tool().is_some());
        assert_eq!(d.flatten(), "final answer");
    }

    #[test]
    fn thinking_step_opens_trace_implicitly() {
        let mut d = doc();
        assert!(d.push_thinking_step("looking at costs"));
        assert!(d.close_thinking(Some(2.0)));
        let trace = d.thinking.as_ref().unwrap();
        assert_eq!(trace.steps, vec!["looking at costs"]);
        assert_eq!(trace.duration, Some(2.0));
    }

    #[test]
    fn terminal_is_sticky_but_accepts_usage() {
        let mut d = doc();
        let _ = d.append_text("partial");
        let _ = d.set_status_hint(StatusHint {
            status_type: "querying".into(),
            message: None,
            estimated_seconds: None,
            details: None,
        });
        assert!(d.cancel());
        assert!(d.status_hint.is_none());
        assert!(!d.append_text("more"));
        assert!(!d.fail("late"));
        assert_eq!(d.status, DocumentStatus::Cancelled);
        d.apply_token_usage(TokenUsage {
            input_tokens: 5,
            ..TokenUsage::default()
        });
        assert_eq!(d.token_usage.as_ref().unwrap().input_tokens, 5);
        assert_eq!(d.flatten(), "partial");
    }

    #[test]
    fn restored_document_is_interrupted() {
        let d = Document::restored(
            TurnId::from("query_1_aaaaaaaa"),
            ConversationId::from("c1"),
            MessageId::from("m1"),
            "half an answer".into(),
        );
        assert!(d.interrupted);
        assert_eq!(d.status, DocumentStatus::Cancelled);
        assert_eq!(d.flatten(), "half an answer");
    }

    #[derive(Clone, Debug)]
    enum Op {
        Delta(String),
        Tool(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            "[a-z ]{0,6}".prop_map(Op::Delta),
            (0u8..4).prop_map(Op::Tool),
        ]
    }

    proptest! {
        #[test]
        fn flatten_is_concatenation_of_deltas(deltas in proptest::collection::vec(".{0,8}", 0..40)) {
            let mut d = doc();
            for delta in &deltas {
                let _ = d.append_text(delta);
            }
            prop_assert_eq!(d.flatten(), deltas.concat());
            prop_assert!(d.segments.len() <= 1);
        }

        #[test]
        fn interleaving_never_leaves_adjacent_text(ops in proptest::collection::vec(op(), 0..40)) {
            let mut d = doc();
            let mut expected = String::new();
            let mut tools = 0usize;
            for op in &ops {
                match op {
                    Op::Delta(text) => {
                        expected.push_str(text);
                        let _ = d.append_text(text);
                    }
                    Op::Tool(id) => {
                        if d.start_tool(&id.to_string(), "t", Value::Null, None, Utc::now()) == ToolStart::Inserted {
                            tools += 1;
                        }
                    }
                }
            }
            prop_assert!(no_adjacent_text(&d));
            prop_assert_eq!(d.flatten(), expected);
            prop_assert_eq!(d.segments.iter().filter(|s| s.as_tool().is_some()).count(), tools);
        }
    }
}
