//! # nimbus-engine
//!
//! Turns a record stream into an ordered answer document:
//!
//! - [`dispatcher`]: one handler per record tag, mutate then emit
//! - [`document`]: the per-turn document state machine
//! - [`identity`]: conversation store and mid-turn re-keying
//! - [`guard`]: per-turn duplicate and early-accounting guards
//! - [`cancellation`]: local abort plus a single server cancel per burst
//! - [`recovery`]: persist and restore an interrupted answer
//! - [`engine`]: the turn lifecycle tying it together

#![deny(unsafe_code)]

pub mod cancellation;
pub mod dispatcher;
pub mod document;
pub mod emitter;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod identity;
pub mod recovery;
pub mod turn;

pub use cancellation::{CancelOutcome, CancellationController, RemoteCancel};
pub use dispatcher::{EngineState, Flow, dispatch};
pub use document::{Document, DocumentStatus, Segment, ToolInvocation, ToolStatus};
pub use emitter::{DocumentEvent, EventEmitter};
pub use engine::{ChatEngine, RecordSource, STREAM_ENDED_MESSAGE, TEARDOWN_REASON};
pub use errors::{EngineError, Result};
pub use identity::{ConversationRecord, ConversationStore};
pub use recovery::{RecoveryRecord, RecoveryStore};
pub use turn::{FinishCallback, Turn, TurnContext, TurnOutcome, TurnRequest};
