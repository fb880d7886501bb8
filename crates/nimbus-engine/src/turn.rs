//! Turn, per-turn context, and terminal outcome.

use chrono::{DateTime, Utc};
use nimbus_core::{ConversationId, TurnId};
use nimbus_transport::Attachment;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::guard::ProcessedIds;

/// One request/response cycle.
#[derive(Clone, Debug)]
pub struct Turn {
    /// Client-generated turn id (`query_id` on the wire).
    pub turn_id: TurnId,
    /// Owning conversation; corrected mid-turn by the identity reconciler.
    pub conversation_id: ConversationId,
    /// Cancellation token owned by this turn.
    pub cancel: CancellationToken,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome of a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The server completed the response.
    Completed,
    /// Transport-fatal or domain-fatal failure.
    Failed {
        /// User-visible message.
        message: String,
    },
    /// Stopped by the user or by teardown. Never an error.
    Cancelled,
}

impl TurnOutcome {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Cleanup callback fired exactly once per turn.
pub type FinishCallback = Box<dyn FnOnce(&TurnOutcome) + Send>;

/// Everything the dispatcher needs for one turn.
///
/// A fresh context is allocated for every turn, so per-turn guards cannot
/// leak across turns.
pub struct TurnContext {
    /// The turn.
    pub turn: Turn,
    /// Tool ids admitted in this turn.
    pub processed: ProcessedIds,
    pub(crate) on_finish: Option<FinishCallback>,
    pub(crate) finished: bool,
}

impl TurnContext {
    /// Wrap a turn with empty guards.
    pub fn new(turn: Turn) -> Self {
        Self {
            turn,
            processed: ProcessedIds::new(),
            on_finish: None,
            finished: false,
        }
    }

    /// Install the cleanup callback.
    pub fn on_finish(&mut self, callback: impl FnOnce(&TurnOutcome) + Send + 'static) {
        self.on_finish = Some(Box::new(callback));
    }

    /// Whether the turn already reached its outcome.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl std::fmt::Debug for TurnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnContext")
            .field("turn", &self.turn)
            .field("processed", &self.processed.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// What the user submitted.
#[derive(Clone, Debug, Default)]
pub struct TurnRequest {
    /// Query text.
    pub query: String,
    /// Explicit conversation; falls back to the active one, then a new id.
    pub conversation_id: Option<ConversationId>,
    /// AWS account ids.
    pub account_ids: Vec<String>,
    /// GCP account ids.
    pub gcp_account_ids: Vec<String>,
    /// Model selection.
    pub model_id: Option<String>,
    /// Image attachments.
    pub images: Vec<Attachment>,
    /// Document attachments.
    pub files: Vec<Attachment>,
}

impl TurnRequest {
    /// Request with only a query.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}
