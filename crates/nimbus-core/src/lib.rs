//! # nimbus-core
//!
//! Foundation types shared by every Nimbus crate:
//!
//! - **Branded IDs**: `TurnId`, `ConversationId`, `MessageId` as newtypes
//! - **Records**: the closed [`records::Record`] schema decoded from the stream
//! - **Token accounting**: [`records::TokenUsage`]
//! - **Logging**: `tracing` subscriber setup and test log capture
//! - **Text**: UTF-8-safe truncation for log previews

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod records;
pub mod text;

pub use ids::{ConversationId, MessageId, TurnId};
pub use records::{Envelope, Record, RecordError, TokenUsage};
