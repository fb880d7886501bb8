//! Broadcast-based emitter for [`DocumentEvent`]s.
//!
//! Every event is emitted right after the mutation it describes.

use nimbus_core::{ConversationId, TokenUsage, TurnId};
use tokio::sync::broadcast;

use crate::document::{StatusHint, ToolStatus};
use crate::turn::TurnOutcome;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Notification of a document mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentEvent {
    /// A turn was submitted.
    TurnStarted {
        /// Turn id.
        turn_id: TurnId,
        /// Conversation at submission time.
        conversation_id: ConversationId,
    },
    /// Text was appended.
    TextAppended {
        /// Turn id.
        turn_id: TurnId,
        /// Appended fragment.
        delta: String,
    },
    /// All text was replaced.
    TextReplaced {
        /// Turn id.
        turn_id: TurnId,
        /// New full text.
        content: String,
    },
    /// A tool invocation started.
    ToolStarted {
        /// Turn id.
        turn_id: TurnId,
        /// Invocation id.
        tool_id: String,
        /// Tool name.
        name: String,
    },
    /// A tool invocation received its full arguments.
    ToolArgsUpdated {
        /// Turn id.
        turn_id: TurnId,
        /// Invocation id.
        tool_id: String,
    },
    /// A tool invocation finished.
    ToolFinished {
        /// Turn id.
        turn_id: TurnId,
        /// Invocation id.
        tool_id: String,
        /// Final status.
        status: ToolStatus,
    },
    /// The thinking trace changed.
    ThinkingUpdated {
        /// Turn id.
        turn_id: TurnId,
        /// Latest step, if the change added one.
        step: Option<String>,
    },
    /// The status hint changed.
    StatusHint {
        /// Turn id.
        turn_id: TurnId,
        /// New hint.
        hint: StatusHint,
    },
    /// Token accounting was applied to a document.
    TokenUsageApplied {
        /// Turn id.
        turn_id: TurnId,
        /// Applied counts.
        usage: TokenUsage,
    },
    /// A conversation moved to a new id.
    ConversationRekeyed {
        /// Previous id.
        from: ConversationId,
        /// New id.
        to: ConversationId,
    },
    /// The turn reached its outcome. Fires once per turn.
    TurnFinished {
        /// Turn id.
        turn_id: TurnId,
        /// Outcome.
        outcome: TurnOutcome,
    },
}

impl DocumentEvent {
    /// Turn the event belongs to, if any.
    pub fn turn_id(&self) -> Option<&TurnId> {
        match self {
            Self::TurnStarted { turn_id, .. }
            | Self::TextAppended { turn_id, .. }
            | Self::TextReplaced { turn_id, .. }
            | Self::ToolStarted { turn_id, .. }
            | Self::ToolArgsUpdated { turn_id, .. }
            | Self::ToolFinished { turn_id, .. }
            | Self::ThinkingUpdated { turn_id, .. }
            | Self::StatusHint { turn_id, .. }
            | Self::TokenUsageApplied { turn_id, .. }
            | Self::TurnFinished { turn_id, .. } => Some(turn_id),
            Self::ConversationRekeyed { .. } => None,
        }
    }

    /// Event kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TurnStarted { .. } => "turn_started",
            Self::TextAppended { .. } => "text_appended",
            Self::TextReplaced { .. } => "text_replaced",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolArgsUpdated { .. } => "tool_args_updated",
            Self::ToolFinished { .. } => "tool_finished",
            Self::ThinkingUpdated { .. } => "thinking_updated",
            Self::StatusHint { .. } => "status_hint",
            Self::TokenUsageApplied { .. } => "token_usage_applied",
            Self::ConversationRekeyed { .. } => "conversation_rekeyed",
            Self::TurnFinished { .. } => "turn_finished",
        }
    }
}

/// Broadcast-based event emitter.
///
/// Non-blocking: `emit` never awaits. Slow receivers lag and drop events
/// rather than blocking the dispatcher.
pub struct EventEmitter {
    tx: broadcast::Sender<DocumentEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new emitter with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Returns the number of receivers.
    pub fn emit(&self, event: DocumentEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
