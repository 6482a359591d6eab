/// Bodies exchanged with gateway callers.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /chat`.
///
/// Both fields are kept as raw JSON: presence and type are checked by the validator, so a field
/// that is missing or of the wrong type produces a message naming it instead of a generic decode
/// error, and a field the deployment ignores can't fail the request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: Option<Value>,
    /// JSON schema for a structured reply, sent as a string containing JSON.
    #[serde(default, rename = "responseSchema")]
    pub response_schema: Option<Value>,
}

/// Successful `POST /chat` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatReply {
    pub reply: String,
}

/// Successful `GET /ping` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PingResponse {
    pub ok: bool,
}

/// The body of every failed request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
