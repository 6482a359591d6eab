//! aff-gateway - a small authenticated gateway in front of the OpenAI Responses API
//!
//! Callers send a prompt (and optionally a JSON schema for a structured reply) to `POST /chat`
//! and get `{"reply": "..."}` back. Every route checks a single shared secret in the
//! `aff-api-key` header and enforces a per-route fixed-window rate limit before doing anything
//! else. Every failure is rendered as `{"error": "..."}`.

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use bon::Builder;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod auth;
pub mod client;
pub mod completion;
pub mod errors;
pub mod guard;
pub mod handlers;
pub mod models;
pub mod rate_limit;
pub mod validation;

use auth::ConstantTimeString;
use client::{HttpClient, HyperClient, PoolSettings};
use completion::{CompletionForwarder, UpstreamSettings};
use errors::SettingsError;
use guard::RouteGuard;
use rate_limit::{Clock, FixedWindowLimiter, RatePolicy, Route, SystemClock};
use validation::StructuredOutput;

/// Everything the gateway is configured with, built once at startup.
#[derive(Debug, Clone, Builder)]
pub struct GatewaySettings {
    /// The shared secret callers must send in `aff-api-key`.
    #[builder(into)]
    pub api_key: ConstantTimeString,
    pub upstream: UpstreamSettings,
    #[builder(default)]
    pub structured_output: StructuredOutput,
    #[builder(default = RatePolicy::per_minute(10))]
    pub ping_limit: RatePolicy,
    #[builder(default = RatePolicy::per_minute(3))]
    pub chat_limit: RatePolicy,
    /// Key rate limits on `X-Forwarded-For` instead of the peer address.
    #[builder(default)]
    pub trust_forwarded_for: bool,
    #[builder(default)]
    pub pool: PoolSettings,
}

/// The main application state containing the HTTP client and the request pipeline
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub api_key: Arc<ConstantTimeString>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub forwarder: Arc<CompletionForwarder>,
    pub structured_output: StructuredOutput,
    pub trust_forwarded_for: bool,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(settings: GatewaySettings) -> Result<Self, SettingsError> {
        let http_client = client::create_hyper_client(settings.pool);
        Self::with_client(settings, http_client)
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(settings: GatewaySettings, http_client: T) -> Result<Self, SettingsError> {
        Self::with_client_and_clock(settings, http_client, Arc::new(SystemClock))
    }

    /// Create a new AppState whose rate limiter reads time from `clock`
    pub fn with_client_and_clock(
        settings: GatewaySettings,
        http_client: T,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SettingsError> {
        if settings.api_key.is_empty() {
            return Err(SettingsError::EmptyApiKey);
        }
        let forwarder = CompletionForwarder::new(settings.upstream)?;
        let limiter =
            FixedWindowLimiter::with_clock(settings.ping_limit, settings.chat_limit, clock);

        Ok(Self {
            http_client,
            api_key: Arc::new(settings.api_key),
            limiter: Arc::new(limiter),
            forwarder: Arc::new(forwarder),
            structured_output: settings.structured_output,
            trust_forwarded_for: settings.trust_forwarded_for,
        })
    }

    fn guard(&self, route: Route) -> RouteGuard {
        RouteGuard {
            route,
            api_key: Arc::clone(&self.api_key),
            limiter: Arc::clone(&self.limiter),
            trust_forwarded_for: self.trust_forwarded_for,
        }
    }
}

/// Build the main router for the gateway
/// This creates routes for:
/// - `GET /ping` - Authenticated liveness check
/// - `POST /chat` - Forwards a prompt upstream and returns the reply
///
/// Unknown paths and methods get JSON 404/405 bodies. To key rate limits on the peer address,
/// serve the router with `into_make_service_with_connect_info::<SocketAddr>()`.
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    let ping_guard = state.guard(Route::Ping);
    let chat_guard = state.guard(Route::Chat);

    Router::new()
        .route(
            "/ping",
            get(handlers::ping).route_layer(from_fn_with_state(ping_guard, guard::enforce)),
        )
        .route(
            "/chat",
            post(handlers::chat::<T>).route_layer(from_fn_with_state(chat_guard, guard::enforce)),
        )
        .method_not_allowed_fallback(handlers::method_not_allowed)
        .fallback(handlers::not_found)
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// # Parameters
/// - `prefix`: A string prefix for the metrics. Accepts either a string literal or an owned
///   string; the metrics layer needs it for the lifetime of the program.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

/// A recording stand-in for the upstream, shared by unit and integration tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{HeaderValue, StatusCode, header::CONTENT_TYPE};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    type Outcome = Result<axum::response::Response, String>;

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        response_builder: Arc<dyn Fn() -> Outcome + Send + Sync>,
        delay: Option<Duration>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: Arc::new(move || {
                    let mut response =
                        axum::response::Response::new(axum::body::Body::from(body.clone()));
                    *response.status_mut() = status;
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    Ok(response)
                }),
                delay: None,
            }
        }

        /// A client whose every request fails at the transport level.
        pub fn failing(message: &str) -> Self {
            let message = message.to_string();
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: Arc::new(move || Err(message.clone())),
                delay: None,
            }
        }

        /// Waits `delay` before answering.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("response_builder", &"<closure>")
                .field("delay", &self.delay)
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                response_builder: Arc::clone(&self.response_builder),
                delay: self.delay,
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(MockRequest {
                    method,
                    uri,
                    headers,
                    body,
                });

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            (self.response_builder)().map_err(|message| message.into())
        }
    }
}
