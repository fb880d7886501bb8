//! Streaming HTTP client for the query and cancel endpoints.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::CredentialProvider;
use crate::errors::{Result, TransportError};
use crate::request::{CancelAck, CancelRequest, QueryRequest};
use crate::sse::parse_frames;
use crate::stream::{RecordStream, record_stream};

/// Client for `POST /sse/query/v2` and `POST /sse/cancel/v2/{query_id}`.
#[derive(Clone)]
pub struct SseClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl SseClient {
    /// Build a client with a connection-level timeout and no overall deadline.
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::with_client(http, base_url, credentials))
    }

    /// Build a client around an existing `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            credentials,
        }
    }

    /// API root, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open the record stream for one turn.
    ///
    /// A 401 triggers one credential refresh and one retry; a second 401 is
    /// [`TransportError::Unauthorized`]. Cancelling `cancel` before the
    /// response arrives yields [`TransportError::Aborted`].
    pub async fn open_stream(
        &self,
        request: &QueryRequest,
        cancel: CancellationToken,
    ) -> Result<RecordStream> {
        let url = format!("{}/sse/query/v2", self.base_url);
        info!(
            turn_id = %request.query_id,
            conversation_id = %request.session_id,
            "opening record stream"
        );

        let token = self.credentials.access_token().await?;
        let mut response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Aborted),
            response = self.post_query(&url, request, token.as_deref()) => response?,
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(turn_id = %request.query_id, "stream request unauthorized, refreshing credentials");
            let fresh = self.credentials.refresh().await?;
            response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Aborted),
                response = self.post_query(&url, request, Some(&fresh)) => response?,
            };
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(TransportError::Unauthorized {
                    message: body_preview(response).await,
                });
            }
        }

        let status = response.status();
        if !status.is_success() {
            let message = body_preview(response).await;
            warn!(status = status.as_u16(), %message, "stream request failed");
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let frames = parse_frames(response.bytes_stream());
        Ok(record_stream(frames, cancel))
    }

    /// Ask the server to stop generating a turn.
    ///
    /// Sent without credentials when none are available. A `success: false`
    /// answer (unknown query) is logged and returned, not an error.
    pub async fn cancel_query(&self, query_id: &str, reason: &str) -> Result<CancelAck> {
        let url = format!("{}/sse/cancel/v2/{query_id}", self.base_url);
        let token = match self.credentials.access_token().await {
            Ok(token) => token,
            Err(e) => {
                debug!(error = %e, "no credentials for cancel call, sending unauthenticated");
                None
            }
        };

        let body = CancelRequest {
            reason: reason.to_owned(),
        };
        let response = self.post_json(&url, &body, token.as_deref(), false).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: body_preview(response).await,
            });
        }

        let text = response.text().await?;
        let ack: CancelAck = serde_json::from_str(&text)?;
        if ack.success {
            info!(turn_id = query_id, reason, "server acknowledged cancel");
        } else {
            warn!(
                turn_id = query_id,
                error = ack.error.as_deref().unwrap_or("unknown"),
                "server did not cancel query"
            );
        }
        Ok(ack)
    }

    async fn post_query(
        &self,
        url: &str,
        request: &QueryRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        self.post_json(url, request, token, true).await
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        token: Option<&str>,
        event_stream: bool,
    ) -> Result<reqwest::Response> {
        let mut builder = self.http.post(url).json(body);
        if event_stream {
            builder = builder.header(ACCEPT, "text/event-stream");
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.send().await?)
    }
}

async fn body_preview(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    nimbus_core::text::truncate_with_suffix(&text, 200, "...")
}
