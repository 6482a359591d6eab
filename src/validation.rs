//! Validation of `POST /chat` bodies
use crate::errors::GatewayError;
use crate::models::ChatRequest;
use axum::http::{HeaderMap, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

const PROMPT_FIELD: &str = "prompt";
const SCHEMA_FIELD: &str = "responseSchema";

/// Whether the deployment asks the upstream for schema-constrained replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StructuredOutput {
    /// `responseSchema` is ignored; replies are free text.
    #[default]
    Disabled,
    /// `responseSchema` is used when the caller sends one.
    Optional,
    /// Every request must carry a `responseSchema`.
    Required,
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChat {
    pub prompt: String,
    pub schema: Option<Map<String, Value>>,
}

/// Decodes a raw `/chat` body.
///
/// Bodies not labelled `application/json` are not read at all, and neither is an empty body:
/// both are treated as `{}`, so the caller hears about the missing prompt. A JSON body must be
/// an object.
pub fn parse_chat_body(headers: &HeaderMap, body: &[u8]) -> Result<ChatRequest, GatewayError> {
    if !is_json(headers) {
        debug!("Ignoring chat body without a JSON content type");
        return Ok(ChatRequest::default());
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ChatRequest::default());
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(object @ Value::Object(_)) => serde_json::from_value(object).map_err(|e| {
            debug!(error = %e, "Rejecting undecodable chat body");
            GatewayError::InvalidBody
        }),
        Ok(other) => {
            debug!(kind = json_kind(&other), "Rejecting chat body that is not an object");
            Err(GatewayError::InvalidBody)
        }
        Err(e) => {
            debug!(error = %e, "Rejecting undecodable chat body");
            Err(GatewayError::InvalidBody)
        }
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}

pub fn validate_chat(
    request: ChatRequest,
    mode: StructuredOutput,
) -> Result<ValidatedChat, GatewayError> {
    // Anything but a non-empty string is unusable as a prompt.
    let prompt = match request.prompt {
        Some(Value::String(prompt)) if !prompt.is_empty() => prompt,
        _ => return Err(GatewayError::MissingField(PROMPT_FIELD)),
    };

    let schema_text = match mode {
        StructuredOutput::Disabled => None,
        StructuredOutput::Optional => schema_text(request.response_schema)?,
        StructuredOutput::Required => Some(
            schema_text(request.response_schema)?
                .ok_or(GatewayError::MissingField(SCHEMA_FIELD))?,
        ),
    };

    let schema = schema_text.map(|text| parse_schema(&text)).transpose()?;

    Ok(ValidatedChat { prompt, schema })
}

/// The schema travels as a string holding JSON. Null and `""` count as absent.
fn schema_text(value: Option<Value>) -> Result<Option<String>, GatewayError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(other) => {
            debug!(kind = json_kind(&other), "Rejecting response schema that is not a string");
            Err(GatewayError::InvalidSchema(SCHEMA_FIELD))
        }
    }
}

/// The upstream only accepts object schemas, so anything else is rejected the same way as
/// unparseable text.
fn parse_schema(text: &str) -> Result<Map<String, Value>, GatewayError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(schema)) => Ok(schema),
        Ok(other) => {
            debug!(kind = json_kind(&other), "Rejecting non-object response schema");
            Err(GatewayError::InvalidSchema(SCHEMA_FIELD))
        }
        Err(e) => {
            debug!(error = %e, "Rejecting unparseable response schema");
            Err(GatewayError::InvalidSchema(SCHEMA_FIELD))
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
