//! Stream record schema.
//!
//! Every SSE frame carries one JSON payload whose own `type` field selects
//! the [`Record`] variant. The optional `event:` line of the frame is never
//! consulted for dispatch.
//!
//! Decoding is forward compatible: a payload with an unrecognized `type`
//! becomes [`Record::Unknown`] instead of an error, so newer servers can add
//! record kinds without breaking older clients. Only payloads that are not
//! JSON, lack a `type`, or carry a known tag with an invalid body fail with
//! a [`RecordError`].
//!
//! Optional auxiliary fields decode leniently so a bad value never costs the
//! record it sits in: token counts accept `null` and floats, a malformed
//! nested `token_usage` on `complete` becomes `None`, and error texts accept
//! any JSON value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// Every `type` tag the client understands.
pub const KNOWN_TAGS: &[&str] = &[
    "message_start",
    "message_complete",
    "session_created",
    "session_renewed",
    "thinking_start",
    "thinking_step",
    "thinking_end",
    "thinking",
    "tool_call_start",
    "tool_call_result",
    "tool_call_error",
    "content_delta",
    "chunk",
    "response",
    "status",
    "token_usage",
    "complete",
    "error",
    "generation_cancelled",
    "cancellation_acknowledged",
    "ping",
    "pong",
];

/// Errors raised while decoding a single record payload.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The payload is not valid JSON.
    #[error("record payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload has no string `type` field.
    #[error("record payload has no type field")]
    MissingType,

    /// The payload has a known tag but a body that does not match it.
    #[error("invalid {tag} record: {source}")]
    Invalid {
        /// The record tag.
        tag: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Token accounting for one turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    /// Prompt tokens.
    #[serde(deserialize_with = "lenient_count")]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(deserialize_with = "lenient_count")]
    pub output_tokens: u64,
    /// Tokens served from the prompt cache.
    #[serde(deserialize_with = "lenient_count")]
    pub cache_read_tokens: u64,
    /// Tokens written to the prompt cache.
    #[serde(deserialize_with = "lenient_count")]
    pub cache_write_tokens: u64,
    /// Fraction of input served from cache.
    #[serde(deserialize_with = "lenient_rate")]
    pub input_cache_hit_rate: f64,
    /// Fraction of output served from cache.
    #[serde(deserialize_with = "lenient_rate")]
    pub output_cache_hit_rate: f64,
}

impl TokenUsage {
    /// Total billed tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Body of a `tool_call_start` record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallStart {
    /// Invocation id, unique within a turn.
    pub tool_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Tool arguments.
    #[serde(default)]
    pub args: Value,
    /// Late full-argument delivery for an id that was already announced.
    #[serde(default)]
    pub update: bool,
}

/// Body of a `status` record: transient presentation hints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Status kind (e.g. `initializing`).
    pub status_type: String,
    /// Display message.
    #[serde(default)]
    pub message: Option<String>,
    /// Estimated remaining seconds.
    #[serde(default)]
    pub estimated_seconds: Option<f64>,
    /// Free-form details.
    #[serde(default)]
    pub details: Option<Value>,
    /// Owning conversation, when the server includes it.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Owning turn, when the server includes it.
    #[serde(default)]
    pub query_id: Option<String>,
}

/// Body of a `complete` record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Whether the turn produced a response.
    #[serde(default = "default_true")]
    pub success: bool,
    /// Failure message when `success` is false.
    #[serde(default, deserialize_with = "lenient_text")]
    pub error: Option<String>,
    /// Final token accounting; `None` when absent or malformed.
    #[serde(default, deserialize_with = "lenient_usage")]
    pub token_usage: Option<TokenUsage>,
    /// Model stop reason (`end_turn`, `max_tokens`, ...).
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Owning turn.
    #[serde(default)]
    pub query_id: Option<String>,
    /// Server-side timing metadata.
    #[serde(default)]
    pub meta: Option<Value>,
}

fn default_true() -> bool {
    true
}

/// Token count: `null`, negatives and non-numbers read as 0, floats truncate.
fn lenient_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let count = match &value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(float_to_count)),
        Value::String(s) => s.trim().parse::<f64>().ok().and_then(float_to_count),
        _ => None,
    };
    Ok(count.unwrap_or(0))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn float_to_count(f: f64) -> Option<u64> {
    (f.is_finite() && f >= 0.0).then(|| f.trunc() as u64)
}

/// Cache-hit fraction: anything but a number reads as 0.
fn lenient_rate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Value::deserialize(deserializer)?.as_f64().unwrap_or(0.0))
}

/// Nested accounting that does not decode is dropped with a warning.
fn lenient_usage<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<TokenUsage>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    match TokenUsage::deserialize(&value) {
        Ok(usage) => Ok(Some(usage)),
        Err(e) => {
            warn!(error = %e, "dropping malformed token_usage");
            Ok(None)
        }
    }
}

/// Free-form error text: strings verbatim, other values as JSON, empty as `None`.
fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let text = value_to_text(&Value::deserialize(deserializer)?);
    Ok((!text.is_empty()).then_some(text))
}

/// Message of an `error` record: `error` first, then `content`.
pub fn error_message(error: Option<String>, content: Option<String>) -> Option<String> {
    error.or(content)
}

/// One decoded protocol event, discriminated by its `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    /// The assistant message started.
    MessageStart {
        /// Owning conversation.
        #[serde(default)]
        session_id: Option<String>,
        /// Message role.
        #[serde(default)]
        role: Option<String>,
    },

    /// The server finished persisting the assistant message.
    MessageComplete {
        /// Owning conversation.
        #[serde(default)]
        session_id: Option<String>,
        /// Owning turn.
        #[serde(default)]
        query_id: Option<String>,
    },

    /// The server confirmed (or assigned) the conversation id.
    SessionCreated {
        /// Confirmed conversation id.
        session_id: String,
        /// Owning turn.
        #[serde(default)]
        query_id: Option<String>,
    },

    /// The server replaced an expired conversation identity mid-turn.
    SessionRenewed {
        /// Previous conversation id.
        old_session_id: String,
        /// Replacement conversation id.
        new_session_id: String,
        /// Machine-readable reason.
        #[serde(default)]
        reason: Option<String>,
        /// Display message.
        #[serde(default)]
        message: Option<String>,
    },

    /// A thinking trace opened.
    ThinkingStart,

    /// One thinking step.
    ThinkingStep {
        /// Step text.
        content: String,
    },

    /// The thinking trace closed.
    ThinkingEnd {
        /// Total thinking duration in seconds.
        #[serde(default)]
        duration: Option<f64>,
    },

    /// Legacy bare narration, treated as a step.
    Thinking {
        /// Narration text.
        content: String,
    },

    /// A tool invocation started (or its arguments were updated).
    ToolCallStart(ToolCallStart),

    /// A tool invocation produced a result.
    ToolCallResult {
        /// Invocation id.
        tool_use_id: String,
        /// Tool output.
        #[serde(default)]
        result: Value,
        /// `success` or `error`.
        #[serde(default)]
        status: Option<String>,
    },

    /// A tool invocation failed.
    ToolCallError {
        /// Invocation id.
        tool_use_id: String,
        /// Error payload (string or structured).
        #[serde(default)]
        error: Value,
    },

    /// Append-only text delta.
    ContentDelta {
        /// Text fragment.
        delta: String,
        /// Owning conversation, when the server tags content.
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Append-only text chunk (older name for a delta).
    Chunk {
        /// Text fragment.
        content: String,
        /// Owning conversation, when the server tags content.
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Full replacement of the message text.
    Response {
        /// Complete text.
        content: String,
        /// Owning conversation, when the server tags content.
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Transient status hint.
    Status(StatusUpdate),

    /// Token accounting, possibly ahead of the document.
    TokenUsage {
        /// Owning turn.
        #[serde(default)]
        query_id: Option<String>,
        /// Counts.
        #[serde(default)]
        usage: TokenUsage,
    },

    /// Terminal completion record.
    Complete(Completion),

    /// Terminal domain error.
    Error {
        /// Error message.
        #[serde(default, deserialize_with = "lenient_text")]
        error: Option<String>,
        /// Error message under its older field name.
        #[serde(default, deserialize_with = "lenient_text")]
        content: Option<String>,
        /// Owning turn.
        #[serde(default)]
        query_id: Option<String>,
        /// Owning conversation.
        #[serde(default)]
        session_id: Option<String>,
    },

    /// The server stopped generation.
    GenerationCancelled {
        /// Owning turn.
        #[serde(default)]
        query_id: Option<String>,
        /// Machine-readable reason.
        #[serde(default)]
        reason: Option<String>,
        /// Display message.
        #[serde(default)]
        message: Option<String>,
    },

    /// The server acknowledged an out-of-band cancel call.
    CancellationAcknowledged {
        /// Owning turn.
        #[serde(default)]
        query_id: Option<String>,
    },

    /// Heartbeat.
    Ping,

    /// Heartbeat reply.
    Pong,

    /// A record with a tag this client does not know.
    #[serde(skip)]
    Unknown {
        /// The unrecognized tag.
        tag: String,
    },
}

impl Record {
    /// Decode a record from a JSON payload.
    pub fn parse(data: &str) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_str(data)?;
        Self::from_value(value)
    }

    /// Decode a record from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, RecordError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(RecordError::MissingType)?
            .to_owned();
        if !KNOWN_TAGS.contains(&tag.as_str()) {
            return Ok(Self::Unknown { tag });
        }
        serde_json::from_value(value).map_err(|source| RecordError::Invalid { tag, source })
    }

    /// The record's wire tag.
    pub fn tag(&self) -> &str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::MessageComplete { .. } => "message_complete",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionRenewed { .. } => "session_renewed",
            Self::ThinkingStart => "thinking_start",
            Self::ThinkingStep { .. } => "thinking_step",
            Self::ThinkingEnd { .. } => "thinking_end",
            Self::Thinking { .. } => "thinking",
            Self::ToolCallStart(_) => "tool_call_start",
            Self::ToolCallResult { .. } => "tool_call_result",
            Self::ToolCallError { .. } => "tool_call_error",
            Self::ContentDelta { .. } => "content_delta",
            Self::Chunk { .. } => "chunk",
            Self::Response { .. } => "response",
            Self::Status(_) => "status",
            Self::TokenUsage { .. } => "token_usage",
            Self::Complete(_) => "complete",
            Self::Error { .. } => "error",
            Self::GenerationCancelled { .. } => "generation_cancelled",
            Self::CancellationAcknowledged { .. } => "cancellation_acknowledged",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown { tag } => tag,
        }
    }

    /// Conversation id carried by the record, if any.
    ///
    /// `session_renewed` reports neither of its ids here: it addresses two
    /// conversations and is routed by the identity reconciler instead.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::MessageStart { session_id, .. }
            | Self::MessageComplete { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::ContentDelta { session_id, .. }
            | Self::Chunk { session_id, .. }
            | Self::Response { session_id, .. } => session_id.as_deref(),
            Self::Status(status) => status.session_id.as_deref(),
            Self::SessionCreated { session_id, .. } => Some(session_id.as_str()),
            _ => None,
        }
    }

    /// Turn id (`query_id`) carried by the record, if any.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            Self::MessageComplete { query_id, .. }
            | Self::SessionCreated { query_id, .. }
            | Self::TokenUsage { query_id, .. }
            | Self::Error { query_id, .. }
            | Self::GenerationCancelled { query_id, .. }
            | Self::CancellationAcknowledged { query_id } => query_id.as_deref(),
            Self::Status(status) => status.query_id.as_deref(),
            Self::Complete(completion) => completion.query_id.as_deref(),
            _ => None,
        }
    }

    /// Whether the transport must stop reading after this record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error { .. })
    }

    /// Whether this is a keep-alive record that never reaches the dispatcher.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

/// Render a JSON value as display text: strings verbatim, everything else as JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A decoded record plus the frame metadata it arrived with.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// The frame's `id:` line.
    pub id: Option<String>,
    /// The frame's `event:` line (informational only).
    pub event: Option<String>,
    /// The payload's `timestamp` field.
    pub timestamp: Option<DateTime<Utc>>,
    /// The record.
    pub record: Record,
}

impl Envelope {
    /// Wrap a record without frame metadata.
    pub fn new(record: Record) -> Self {
        Self {
            id: None,
            event: None,
            timestamp: None,
            record,
        }
    }

    /// Decode a frame's `data:` payload into an envelope.
    pub fn decode(
        data: &str,
        event: Option<String>,
        id: Option<String>,
    ) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_str(data)?;
        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_f64)
            .and_then(epoch_seconds_to_datetime);
        let record = Record::from_value(value)?;
        Ok(Self {
            id,
            event,
            timestamp,
            record,
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_seconds_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((seconds * 1_000_000.0) as i64)
}
