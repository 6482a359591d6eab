//! Configuration parsing and validation for the gateway
//!
//! Every option can be given on the command line or through the environment; a `.env` file in
//! the working directory is loaded before parsing.
use aff_gateway::{
    GatewaySettings,
    client::PoolSettings,
    completion::{CompletionForwarder, UpstreamSettings},
    rate_limit::RatePolicy,
    validation::StructuredOutput,
};
use anyhow::{anyhow, bail};
use clap::Parser;
use std::fmt;
use std::time::Duration;
use url::Url;

#[derive(Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the gateway will listen.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Shared secret callers must send in the `aff-api-key` header.
    #[arg(long, env = "AFF_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Credential for the upstream completion API.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub upstream_api_key: String,

    /// Base URL of the upstream API; `responses` is resolved against it.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1/")]
    pub upstream_url: Url,

    /// Model or deployment identifier sent upstream.
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    /// Header carrying the upstream credential (`api-key` for Azure deployments).
    #[arg(long, default_value = "Authorization")]
    pub upstream_auth_header_name: String,

    /// Prefix written before the upstream credential.
    #[arg(long, default_value = "Bearer ")]
    pub upstream_auth_header_prefix: String,

    /// How long (in seconds) to wait for the upstream before failing the request.
    #[arg(long, default_value_t = 60)]
    pub upstream_timeout_secs: u64,

    /// Whether `/chat` sends caller-supplied JSON schemas upstream.
    #[arg(long, env = "STRUCTURED_OUTPUT", value_enum, default_value_t = StructuredOutput::Disabled)]
    pub structured_output: StructuredOutput,

    /// Requests allowed per caller on `/ping` in each window.
    #[arg(long, default_value_t = 10)]
    pub ping_limit: u32,

    /// Length (in seconds) of the `/ping` rate limit window.
    #[arg(long, default_value_t = 60)]
    pub ping_window_secs: u64,

    /// Requests allowed per caller on `/chat` in each window.
    #[arg(long, env = "CHAT_RATE_LIMIT", default_value_t = 3)]
    pub chat_limit: u32,

    /// Length (in seconds) of the `/chat` rate limit window.
    #[arg(long, default_value_t = 60)]
    pub chat_window_secs: u64,

    /// Identify callers by the first `X-Forwarded-For` entry. Only enable behind a proxy that
    /// sets it.
    #[arg(long, default_value_t = false)]
    pub trust_forwarded_for: bool,

    /// Whether to answer CORS requests from any origin.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub cors: bool,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true, action = clap::ArgAction::Set)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "aff_gateway")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive to the upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,

    /// How often (in seconds) stale rate limit counters are dropped.
    #[arg(long, default_value_t = 300)]
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if self.api_key.is_empty() {
            bail!("The gateway api key (AFF_API_KEY) must not be empty");
        }
        if self.upstream_api_key.is_empty() {
            bail!("The upstream api key (OPENAI_API_KEY) must not be empty");
        }
        if self.model.is_empty() {
            bail!("The upstream model must not be empty");
        }
        for (name, value) in [
            ("ping-limit", u64::from(self.ping_limit)),
            ("ping-window-secs", self.ping_window_secs),
            ("chat-limit", u64::from(self.chat_limit)),
            ("chat-window-secs", self.chat_window_secs),
            ("upstream-timeout-secs", self.upstream_timeout_secs),
            ("sweep-interval-secs", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("--{name} must be greater than zero"));
            }
        }
        CompletionForwarder::new(self.settings().upstream)
            .map_err(|e| anyhow!("Unusable upstream settings: {e}"))?;
        if self.metrics && self.metrics_port == self.port {
            bail!(
                "The metrics port and the gateway port must differ (both are {})",
                self.port
            );
        }
        Ok(self)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings::builder()
            .api_key(self.api_key.as_str())
            .upstream(
                UpstreamSettings::builder()
                    .url(self.upstream_url.clone())
                    .api_key(self.upstream_api_key.as_str())
                    .model(self.model.as_str())
                    .auth_header_name(self.upstream_auth_header_name.as_str())
                    .auth_header_prefix(self.upstream_auth_header_prefix.as_str())
                    .timeout(Duration::from_secs(self.upstream_timeout_secs))
                    .build(),
            )
            .structured_output(self.structured_output)
            .ping_limit(RatePolicy::new(
                self.ping_limit,
                Duration::from_secs(self.ping_window_secs),
            ))
            .chat_limit(RatePolicy::new(
                self.chat_limit,
                Duration::from_secs(self.chat_window_secs),
            ))
            .trust_forwarded_for(self.trust_forwarded_for)
            .pool(PoolSettings {
                max_idle_per_host: self.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            })
            .build()
    }
}

/// Secrets are left out so the config can be logged at startup.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("api_key", &"<redacted>")
            .field("upstream_api_key", &"<redacted>")
            .field("upstream_url", &self.upstream_url.as_str())
            .field("model", &self.model)
            .field("upstream_auth_header_name", &self.upstream_auth_header_name)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .field("structured_output", &self.structured_output)
            .field("ping_limit", &self.ping_limit)
            .field("ping_window_secs", &self.ping_window_secs)
            .field("chat_limit", &self.chat_limit)
            .field("chat_window_secs", &self.chat_window_secs)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("cors", &self.cors)
            .field("metrics", &self.metrics)
            .field("metrics_port", &self.metrics_port)
            .field("metrics_prefix", &self.metrics_prefix)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .field("pool_idle_timeout_secs", &self.pool_idle_timeout_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .finish()
    }
}
