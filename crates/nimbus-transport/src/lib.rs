//! # nimbus-transport
//!
//! One cancellable streaming POST per turn, framed into records:
//!
//! - [`sse`]: byte-level SSE frame decoder with a carry-over buffer
//! - [`stream`]: frames to [`nimbus_core::Envelope`]s, heartbeats dropped,
//!   malformed frames skipped, stop at the first terminal record
//! - [`client`]: `POST /sse/query/v2` with one refresh-and-retry on 401, and
//!   the out-of-band `POST /sse/cancel/v2/{query_id}` call
//! - [`auth`]: the [`CredentialProvider`] capability the client calls into

#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod errors;
pub mod request;
pub mod sse;
pub mod stream;

pub use auth::{CredentialProvider, RefreshTokenCredentials, StaticCredentials};
pub use client::SseClient;
pub use errors::{AuthError, Result, TransportError};
pub use request::{Attachment, CancelAck, CancelRequest, QueryRequest};
pub use stream::{RecordStream, record_stream};
