//! Turn lifecycle: submit, read loop, terminal state, teardown, restore.
//!
//! The engine owns the keyed stores behind one lock. The lock is taken per
//! record and never held across an await, so several turns can stream at
//! once without observing each other's partial mutations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use nimbus_core::{ConversationId, MessageId, TurnId};
use nimbus_settings::{NimbusSettings, nimbus_home};
use nimbus_transport::{QueryRequest, RecordStream, SseClient, TransportError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellation::{CancelOutcome, CancellationController, RemoteCancel};
use crate::dispatcher::{EngineState, Flow, dispatch};
use crate::document::{Document, DocumentStatus};
use crate::emitter::{DocumentEvent, EventEmitter};
use crate::recovery::{RecoveryRecord, RecoveryStore};
use crate::turn::{FinishCallback, Turn, TurnContext, TurnOutcome, TurnRequest};

/// Failure message when the stream closes without a terminal record.
pub const STREAM_ENDED_MESSAGE: &str = "stream ended before completion";

/// Cancel reason sent when the client goes away mid-turn.
pub const TEARDOWN_REASON: &str = "page_unload";

/// Opens the record stream of one turn.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Open the stream for `request`, aborting when `cancel` fires.
    async fn open(
        &self,
        request: &QueryRequest,
        cancel: CancellationToken,
    ) -> Result<RecordStream, TransportError>;
}

#[async_trait]
impl RecordSource for SseClient {
    async fn open(
        &self,
        request: &QueryRequest,
        cancel: CancellationToken,
    ) -> Result<RecordStream, TransportError> {
        self.open_stream(request, cancel).await
    }
}

/// Streaming chat engine.
pub struct ChatEngine {
    state: Mutex<EngineState>,
    emitter: EventEmitter,
    controller: Arc<CancellationController>,
    source: Arc<dyn RecordSource>,
    recovery: Option<RecoveryStore>,
}

impl ChatEngine {
    /// Engine reading from `source` and cancelling through `remote`.
    pub fn new(
        source: Arc<dyn RecordSource>,
        remote: Arc<dyn RemoteCancel>,
        cancel_cooldown: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            emitter: EventEmitter::new(),
            controller: Arc::new(CancellationController::new(remote, cancel_cooldown)),
            source,
            recovery: None,
        }
    }

    /// Enable interruption recovery.
    #[must_use]
    pub fn with_recovery(mut self, store: RecoveryStore) -> Self {
        self.recovery = Some(store);
        self
    }

    /// Engine wired to one client for both streaming and cancel calls.
    pub fn from_settings(client: SseClient, settings: &NimbusSettings) -> Self {
        let client = Arc::new(client);
        let engine = Self::new(
            client.clone(),
            client,
            settings.stream.cancel_cooldown(),
        );
        if settings.recovery.enabled {
            engine.with_recovery(RecoveryStore::new(
                nimbus_home().join(&settings.recovery.file),
                settings.recovery.freshness(),
            ))
        } else {
            engine
        }
    }

    /// Allocate a turn and build its wire request.
    ///
    /// The conversation is the explicit one, else the active one, else a
    /// fresh id. Token accounting stashed for other turns is dropped here.
    pub fn begin_turn(&self, request: TurnRequest) -> (TurnContext, QueryRequest) {
        let turn_id = TurnId::generate();
        let conversation_id = {
            let mut state = self.state.lock();
            let conversation_id = request
                .conversation_id
                .clone()
                .or_else(|| state.store.active().cloned())
                .unwrap_or_else(ConversationId::generate);
            let _ = state.store.ensure(&conversation_id);
            state.store.set_active(conversation_id.clone());
            let purged = state.pending.purge_except(&turn_id);
            if purged > 0 {
                debug!(%turn_id, purged, "dropped token usage of earlier turns");
            }
            conversation_id
        };

        let turn = Turn {
            turn_id: turn_id.clone(),
            conversation_id: conversation_id.clone(),
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        };
        self.controller.register(turn_id.clone(), turn.cancel.clone());

        let query = QueryRequest {
            query: request.query,
            query_id: turn_id.to_string(),
            session_id: conversation_id.to_string(),
            account_ids: request.account_ids,
            gcp_account_ids: request.gcp_account_ids,
            model_id: request.model_id,
            images: non_empty(request.images),
            files: non_empty(request.files),
        };

        info!(%turn_id, %conversation_id, query_len = query.query.len(), "turn started");
        let _ = self.emitter.emit(DocumentEvent::TurnStarted {
            turn_id,
            conversation_id,
        });
        (TurnContext::new(turn), query)
    }

    /// Submit a request and drive it to its outcome.
    ///
    /// Returns the turn as it stands at the end, with any conversation
    /// re-key applied.
    pub async fn submit(
        &self,
        request: TurnRequest,
        on_finish: Option<FinishCallback>,
    ) -> (Turn, TurnOutcome) {
        let (mut ctx, query) = self.begin_turn(request);
        ctx.on_finish = on_finish;
        let outcome = self.execute(&mut ctx, &query).await;
        (ctx.turn, outcome)
    }

    /// Open the stream for `query` and run it.
    pub async fn execute(&self, ctx: &mut TurnContext, query: &QueryRequest) -> TurnOutcome {
        match self.source.open(query, ctx.turn.cancel.clone()).await {
            Ok(stream) => self.run(ctx, stream).await,
            Err(e) => {
                let outcome = outcome_for_error(&ctx.turn.turn_id, &e);
                self.finish(ctx, &outcome);
                outcome
            }
        }
    }

    /// Read records until a terminal one, the end of the stream, or
    /// cancellation, then finish the turn.
    pub async fn run(&self, ctx: &mut TurnContext, mut stream: RecordStream) -> TurnOutcome {
        let cancel = ctx.turn.cancel.clone();
        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break TurnOutcome::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(envelope)) => {
                    let flow = {
                        let mut state = self.state.lock();
                        dispatch(&mut state, ctx, &self.emitter, envelope)
                    };
                    if let Flow::Terminal(outcome) = flow {
                        break outcome;
                    }
                }
                Some(Err(e)) => break outcome_for_error(&ctx.turn.turn_id, &e),
                None if cancel.is_cancelled() => break TurnOutcome::Cancelled,
                None => {
                    warn!(turn_id = %ctx.turn.turn_id, "stream ended without a terminal record");
                    break TurnOutcome::Failed {
                        message: STREAM_ENDED_MESSAGE.to_owned(),
                    };
                }
            }
        };
        drop(stream);
        self.finish(ctx, &outcome);
        outcome
    }

    /// Apply the terminal state once.
    ///
    /// Folds in token accounting the turn never received through its
    /// document, unregisters the cancel token, runs the cleanup callback,
    /// and announces the outcome. Later calls are no-ops.
    pub fn finish(&self, ctx: &mut TurnContext, outcome: &TurnOutcome) {
        if ctx.finished {
            return;
        }
        ctx.finished = true;
        let turn_id = ctx.turn.turn_id.clone();

        let applied = {
            let mut state = self.state.lock();
            let pending = state.pending.drain(&turn_id);
            let doc = state
                .store
                .ensure_document(&ctx.turn.conversation_id, &turn_id);
            let applied = match pending {
                Some(usage) if doc.token_usage.is_none() => {
                    doc.apply_token_usage(usage.clone());
                    Some(usage)
                }
                _ => None,
            };
            let _ = match outcome {
                TurnOutcome::Completed => doc.complete(),
                TurnOutcome::Failed { message } => doc.fail(message),
                TurnOutcome::Cancelled => doc.cancel(),
            };
            applied
        };
        if let Some(usage) = applied {
            let _ = self.emitter.emit(DocumentEvent::TokenUsageApplied {
                turn_id: turn_id.clone(),
                usage,
            });
        }

        self.controller.unregister(&turn_id);
        if let Some(callback) = ctx.on_finish.take() {
            callback(outcome);
        }

        match outcome {
            TurnOutcome::Failed { message } => warn!(%turn_id, %message, "turn failed"),
            _ => info!(%turn_id, outcome = outcome.as_str(), "turn finished"),
        }
        let _ = self.emitter.emit(DocumentEvent::TurnFinished {
            turn_id,
            outcome: outcome.clone(),
        });
    }

    /// Cancel a running turn. The first call in a burst does the work.
    pub async fn cancel(&self, turn_id: &TurnId, reason: &str) -> CancelOutcome {
        self.controller.cancel(turn_id, reason).await
    }

    /// Client teardown: save the partial answer, abort locally, and fire the
    /// server cancel without waiting for it.
    pub fn teardown(&self, turn_id: &TurnId) -> Option<JoinHandle<CancelOutcome>> {
        let _ = self.persist_partial(turn_id);
        self.controller
            .cancel_detached(turn_id.clone(), TEARDOWN_REASON.to_owned())
    }

    /// Save the turn's text for recovery. Returns whether a record was saved.
    ///
    /// Completed turns and turns without text are skipped.
    pub fn persist_partial(&self, turn_id: &TurnId) -> bool {
        let Some(store) = &self.recovery else {
            return false;
        };
        let record = {
            let state = self.state.lock();
            let Some(doc) = state.store.find_document(turn_id) else {
                return false;
            };
            if doc.status == DocumentStatus::Completed || doc.flatten().is_empty() {
                return false;
            }
            RecoveryRecord::from_document(doc, Utc::now())
        };
        store.save(&record);
        true
    }

    /// Restore the answer of an interrupted turn, if one is fresh.
    ///
    /// The restored document is cancelled, flagged interrupted, and its
    /// conversation becomes active.
    pub fn restore_interrupted(&self) -> Option<Document> {
        let record = self.recovery.as_ref()?.take_fresh(Utc::now())?;
        let conversation_id = ConversationId::from(record.chat_id);
        let doc = Document::restored(
            TurnId::from(record.query_id),
            conversation_id.clone(),
            MessageId::from(record.message_id),
            record.content,
        );
        info!(turn_id = %doc.turn_id, %conversation_id, "restored interrupted answer");

        let mut state = self.state.lock();
        state.store.insert_document(doc.clone());
        state.store.set_active(conversation_id);
        Some(doc)
    }

    /// Snapshot of a document.
    pub fn document(&self, conversation_id: &ConversationId, turn_id: &TurnId) -> Option<Document> {
        self.state
            .lock()
            .store
            .document(conversation_id, turn_id)
            .cloned()
    }

    /// Snapshot of a document wherever its conversation now lives.
    pub fn find_document(&self, turn_id: &TurnId) -> Option<Document> {
        self.state.lock().store.find_document(turn_id).cloned()
    }

    /// Active conversation.
    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.state.lock().store.active().cloned()
    }

    /// Whether token accounting is stashed for `turn_id`.
    pub fn has_pending_usage(&self, turn_id: &TurnId) -> bool {
        self.state.lock().pending.contains(turn_id)
    }

    /// Subscribe to document events.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.emitter.subscribe()
    }

    /// Event emitter.
    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Cancellation controller.
    pub fn controller(&self) -> &Arc<CancellationController> {
        &self.controller
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn outcome_for_error(turn_id: &TurnId, e: &TransportError) -> TurnOutcome {
    if e.is_aborted() {
        return TurnOutcome::Cancelled;
    }
    warn!(%turn_id, error = %e, category = e.category(), "stream failed");
    TurnOutcome::Failed {
        message: e.to_string(),
    }
}
