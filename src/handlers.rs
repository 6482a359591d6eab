/// Axum handlers for the gateway
///
/// Authentication and rate limiting have already run by the time these are called (see
/// `guard`), so they only deal with the request itself.
use crate::AppState;
use crate::client::HttpClient;
use crate::errors::GatewayError;
use crate::models::{ChatReply, PingResponse};
use crate::validation::{parse_chat_body, validate_chat};
use axum::{
    Json, body::Bytes, extract::State, extract::rejection::BytesRejection, http::HeaderMap,
};
use tracing::{error, info, instrument, warn};

#[instrument]
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse { ok: true })
}

/// Validates the prompt (and schema, if the deployment uses one), forwards it upstream and
/// returns the reply text.
#[instrument(skip_all)]
pub async fn chat<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ChatReply>, GatewayError> {
    let body = body.map_err(|e| {
        warn!(error = %e, "Failed to read request body");
        GatewayError::UnreadableBody
    })?;

    let request = parse_chat_body(&headers, &body)?;
    let chat = validate_chat(request, state.structured_output)?;
    info!(
        prompt_len = chat.prompt.len(),
        structured = chat.schema.is_some(),
        "Forwarding chat request upstream"
    );

    let reply = state
        .forwarder
        .complete(&state.http_client, chat)
        .await
        .map_err(|e| {
            error!(error = %e, "OpenAI request failed");
            GatewayError::from(e)
        })?;

    Ok(Json(ChatReply { reply }))
}

pub async fn not_found() -> GatewayError {
    GatewayError::NotFound
}

pub async fn method_not_allowed() -> GatewayError {
    GatewayError::MethodNotAllowed
}
