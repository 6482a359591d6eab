//! Forwarding prompts to the upstream Responses API
//!
//! A validated chat request becomes one `POST {upstream}/responses` call. When the caller sent a
//! schema, the request carries a strict `json_schema` text format so the model's reply is
//! constrained to it. The reply is the text of the first content entry of the first output item;
//! a response without that path counts as a failure.
use crate::client::HttpClient;
use crate::errors::{SettingsError, UpstreamError};
use crate::validation::ValidatedChat;
use axum::body::Bytes;
use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode, header::CONTENT_TYPE};
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Schema name used when the schema has no usable `title`.
pub const FALLBACK_SCHEMA_NAME: &str = "structured_response";

/// Longest schema name the upstream accepts.
const MAX_SCHEMA_NAME_LEN: usize = 64;

/// Upstream bodies larger than this are treated as a failure.
const MAX_UPSTREAM_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Error bodies are truncated to this many characters before being logged.
const MAX_LOGGED_ERROR_CHARS: usize = 2048;

/// Where and how to reach the upstream completion API.
#[derive(Clone, Builder)]
pub struct UpstreamSettings {
    /// Base URL the `responses` path is resolved against, e.g. `https://api.openai.com/v1/`.
    pub url: Url,
    #[builder(into)]
    pub api_key: String,
    /// Model (or deployment) identifier sent in every request.
    #[builder(into, default = "gpt-4o-mini".to_string())]
    pub model: String,
    #[builder(into, default = "Authorization".to_string())]
    pub auth_header_name: String,
    #[builder(into, default = "Bearer ".to_string())]
    pub auth_header_prefix: String,
    /// Upper bound on a whole upstream exchange, body included.
    #[builder(default = Duration::from_secs(60))]
    pub timeout: Duration,
}

impl fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("url", &self.url.as_str())
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("auth_header_name", &self.auth_header_name)
            .field("auth_header_prefix", &self.auth_header_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Request body for `POST /responses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextConfig {
    pub format: TextFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextFormat {
    JsonSchema {
        name: String,
        schema: Map<String, Value>,
        strict: bool,
    },
}

/// The subset of the upstream response the gateway reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesResponse {
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputItem {
    #[serde(default)]
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentItem {
    #[serde(default)]
    pub text: Option<String>,
}

impl ResponsesResponse {
    /// `output[0].content[0].text`, if present.
    pub fn reply_text(self) -> Option<String> {
        self.output
            .into_iter()
            .next()?
            .content
            .into_iter()
            .next()?
            .text
    }
}

/// Picks the schema's `title` as the format name, mapped onto `[A-Za-z0-9_-]{1,64}`.
pub fn schema_name(schema: &Map<String, Value>) -> String {
    schema
        .get("title")
        .and_then(Value::as_str)
        .map(|title| {
            title
                .trim()
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .take(MAX_SCHEMA_NAME_LEN)
                .collect::<String>()
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_SCHEMA_NAME.to_string())
}

#[derive(Debug, Clone)]
pub struct CompletionForwarder {
    settings: UpstreamSettings,
    endpoint: Url,
    auth_header: (HeaderName, HeaderValue),
}

impl CompletionForwarder {
    /// Resolves the endpoint and the credential header once, so a bad url or header fails at
    /// startup instead of on every request.
    pub fn new(settings: UpstreamSettings) -> Result<Self, SettingsError> {
        let mut base = settings.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("responses")?;

        let name = HeaderName::from_bytes(settings.auth_header_name.as_bytes())
            .map_err(|_| SettingsError::AuthHeaderName(settings.auth_header_name.clone()))?;
        let mut value =
            HeaderValue::from_str(&format!("{}{}", settings.auth_header_prefix, settings.api_key))
                .map_err(|_| SettingsError::AuthHeaderValue)?;
        value.set_sensitive(true);

        Ok(Self {
            settings,
            endpoint,
            auth_header: (name, value),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn build_request(&self, chat: ValidatedChat) -> ResponsesRequest {
        let text = chat.schema.map(|schema| TextConfig {
            format: TextFormat::JsonSchema {
                name: schema_name(&schema),
                schema,
                strict: true,
            },
        });

        ResponsesRequest {
            model: self.settings.model.clone(),
            input: chat.prompt,
            text,
        }
    }

    /// Sends the chat upstream and returns the reply text. Exactly one upstream call is made.
    #[instrument(
        skip_all,
        fields(model = %self.settings.model, structured = chat.schema.is_some())
    )]
    pub async fn complete<T>(&self, client: &T, chat: ValidatedChat) -> Result<String, UpstreamError>
    where
        T: HttpClient + Sync,
    {
        let payload = self.build_request(chat);
        let body = serde_json::to_vec(&payload)
            .map_err(|e| UpstreamError::BuildRequest(e.to_string()))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(self.auth_header.0.clone(), self.auth_header.1.clone())
            .body(axum::body::Body::from(body))
            .map_err(|e| UpstreamError::BuildRequest(e.to_string()))?;

        let (status, bytes) =
            tokio::time::timeout(self.settings.timeout, self.exchange(client, request))
                .await
                .map_err(|_| UpstreamError::Timeout(self.settings.timeout))??;

        if !status.is_success() {
            let body: String = String::from_utf8_lossy(&bytes)
                .chars()
                .take(MAX_LOGGED_ERROR_CHARS)
                .collect();
            return Err(UpstreamError::Status { status, body });
        }

        let response: ResponsesResponse = serde_json::from_slice(&bytes)?;
        let reply = response.reply_text().ok_or(UpstreamError::MissingReply)?;
        debug!(reply_len = reply.len(), "Upstream completion succeeded");
        Ok(reply)
    }

    async fn exchange<T>(
        &self,
        client: &T,
        request: axum::extract::Request,
    ) -> Result<(StatusCode, Bytes), UpstreamError>
    where
        T: HttpClient + Sync,
    {
        let response = client
            .request(request)
            .await
            .map_err(UpstreamError::Transport)?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), MAX_UPSTREAM_BODY_BYTES)
            .await
            .map_err(|e| UpstreamError::ReadBody(e.to_string()))?;
        Ok((status, bytes))
    }
}
