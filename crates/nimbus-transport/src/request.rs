//! Request and response bodies of the query and cancel endpoints.

use serde::{Deserialize, Serialize};

/// One base64-encoded attachment (image or document).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original file name.
    pub file_name: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Base64 payload without a `data:` URI prefix.
    pub base64_data: String,
}

/// Body of `POST /sse/query/v2`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// User query text.
    pub query: String,
    /// Client-generated turn id.
    pub query_id: String,
    /// Owning conversation id.
    pub session_id: String,
    /// AWS account ids in scope.
    #[serde(default)]
    pub account_ids: Vec<String>,
    /// GCP account ids in scope.
    #[serde(default)]
    pub gcp_account_ids: Vec<String>,
    /// Model selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Image attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<Attachment>>,
    /// Document attachments (spreadsheets and the like).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<Attachment>>,
}

/// Body of `POST /sse/cancel/v2/{query_id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Machine-readable reason.
    pub reason: String,
}

impl Default for CancelRequest {
    fn default() -> Self {
        Self {
            reason: "user_cancelled".to_string(),
        }
    }
}

/// Answer of the cancel endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CancelAck {
    /// Whether the server found and stopped the query.
    #[serde(default)]
    pub success: bool,
    /// Confirmation message.
    #[serde(default)]
    pub message: Option<String>,
    /// Failure reason (e.g. `Query not found`).
    #[serde(default)]
    pub error: Option<String>,
    /// Echoed turn id.
    #[serde(default)]
    pub query_id: Option<String>,
    /// Echoed reason.
    #[serde(default)]
    pub reason: Option<String>,
}
