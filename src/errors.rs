//! Error types and their JSON rendering
//!
//! Every failure leaves the gateway as `{"error": "<message>"}`. Upstream failures are logged
//! in full where they happen and rendered with a fixed message, so nothing from the upstream
//! reaches the caller.
use crate::models::ErrorBody;
use crate::rate_limit::RateLimitStatus;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};

/// Failures talking to the upstream completion API.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to build upstream request: {0}")]
    BuildRequest(String),
    #[error("upstream transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("upstream did not respond within {0:?}")]
    Timeout(std::time::Duration),
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to read upstream response body: {0}")]
    ReadBody(String),
    #[error("failed to decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream response has no output[0].content[0].text")]
    MissingReply,
}

/// Settings the gateway refuses to start with.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("the gateway api key must not be empty")]
    EmptyApiKey,
    #[error("invalid upstream url: {0}")]
    UpstreamUrl(#[from] url::ParseError),
    #[error("invalid upstream auth header name {0:?}")]
    AuthHeaderName(String),
    #[error("the upstream credential (with its prefix) is not a valid header value")]
    AuthHeaderValue,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Too many requests, slow down.")]
    RateLimited(RateLimitStatus),
    #[error("Missing '{0}' in body")]
    MissingField(&'static str),
    #[error("Invalid JSON in '{0}'")]
    InvalidSchema(&'static str),
    #[error("Request body must be a JSON object")]
    InvalidBody,
    #[error("Failed to read request body")]
    UnreadableBody,
    #[error("OpenAI request failed")]
    Upstream(#[from] UpstreamError),
    #[error("Not found")]
    NotFound,
    #[error("Method not allowed")]
    MethodNotAllowed,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::MissingField(_)
            | GatewayError::InvalidSchema(_)
            | GatewayError::InvalidBody
            | GatewayError::UnreadableBody => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Display on Upstream is the generic message; the source is only ever logged.
        let body = ErrorBody {
            error: self.to_string(),
        };
        let mut response = (self.status_code(), Json(body)).into_response();

        if let GatewayError::RateLimited(status) = &self {
            status.apply_headers(response.headers_mut());
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(status.reset_secs()));
        }

        response
    }
}
