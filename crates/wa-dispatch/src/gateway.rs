//! Gateway - the automation service that actually speaks the WhatsApp protocol
//!
//! The scheduler only sees the [`Gateway`] trait. [`HttpGateway`] talks to an
//! Evolution-style REST API:
//! - `POST /message/sendText/{instance}` for real sends
//! - `POST /chat/sendPresence/{instance}` for presence and typing
//! - `GET /instance/connectionState/{instance}` for health probes
//!
//! Response classification:
//! - 2xx: delivered
//! - 429: rate limited, honoring `Retry-After` when present
//! - 403 / 410: banned
//! - anything else, including timeouts: transport error

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use wa_common::{ConnectionState, GatewayOutcome, PresenceState, StepResult};
use wa_config::GatewayConfig;

use crate::{DispatchError, Result};

/// Header carrying the gateway API key
pub const API_KEY_HEADER: &str = "apikey";

/// Operations the dispatch path and the maturation engine need from the gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a text message. Never retried by the caller.
    async fn send(&self, instance_id: &str, phone: &str, content: &str) -> GatewayOutcome;

    /// Best-effort presence update shown to the recipient.
    async fn set_presence(&self, instance_id: &str, phone: &str, state: PresenceState) -> StepResult;

    /// Best-effort "typing..." indicator for roughly `duration`.
    async fn set_typing(&self, instance_id: &str, phone: &str, duration: Duration) -> StepResult;

    /// Current connection state of an instance.
    async fn connection_state(&self, instance_id: &str) -> Result<ConnectionState>;
}

#[derive(Debug, Serialize)]
struct SendTextPayload<'a> {
    number: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct PresencePayload<'a> {
    number: &'a str,
    presence: PresenceState,
    /// Milliseconds the presence is held
    delay: u64,
}

#[derive(Debug, Deserialize, Default)]
struct SendTextResponse {
    #[serde(default)]
    key: Option<MessageKey>,
}

#[derive(Debug, Deserialize)]
struct MessageKey {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionStateResponse {
    instance: ConnectionStateBody,
}

#[derive(Debug, Deserialize)]
struct ConnectionStateBody {
    state: String,
}

/// Configuration for [`HttpGateway`]
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl From<&GatewayConfig> for HttpGatewayConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// REST client for an Evolution-style automation gateway
pub struct HttpGateway {
    client: Client,
    config: HttpGatewayConfig,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        info!(
            base_url = %config.base_url,
            timeout_ms = config.timeout.as_millis() as u64,
            "HttpGateway initialized"
        );

        Ok(Self { client, config })
    }

    fn url(&self, path: &str, instance_id: &str) -> String {
        format!("{}/{}/{}", self.config.base_url, path, instance_id)
    }

    async fn post_presence(&self, instance_id: &str, phone: &str, state: PresenceState, delay: Duration) -> StepResult {
        let payload = PresencePayload {
            number: phone,
            presence: state,
            delay: delay.as_millis() as u64,
        };

        let result = self
            .client
            .post(self.url("chat/sendPresence", instance_id))
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => StepResult::Ok,
            Ok(response) => StepResult::SoftFail(format!("presence rejected with HTTP {}", response.status().as_u16())),
            Err(e) => StepResult::SoftFail(e.to_string()),
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_connection_state(raw: &str) -> Option<ConnectionState> {
    match raw.to_ascii_lowercase().as_str() {
        "open" => Some(ConnectionState::Open),
        "connecting" => Some(ConnectionState::Connecting),
        "close" | "closed" => Some(ConnectionState::Close),
        "banned" => Some(ConnectionState::Banned),
        _ => None,
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send(&self, instance_id: &str, phone: &str, content: &str) -> GatewayOutcome {
        let payload = SendTextPayload { number: phone, text: content };

        let response = match self
            .client
            .post(self.url("message/sendText", instance_id))
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let reason = if e.is_timeout() { "gateway timeout".to_string() } else { e.to_string() };
                warn!(instance_id = %instance_id, error = %reason, "Gateway send failed");
                return GatewayOutcome::TransportError { reason };
            }
        };

        let status = response.status();
        match status {
            s if s.is_success() => {
                let message_id = response
                    .json::<SendTextResponse>()
                    .await
                    .unwrap_or_default()
                    .key
                    .and_then(|k| k.id);
                debug!(instance_id = %instance_id, message_id = ?message_id, "Gateway accepted message");
                GatewayOutcome::Delivered { message_id }
            }
            StatusCode::TOO_MANY_REQUESTS => GatewayOutcome::RateLimited {
                retry_after: parse_retry_after(&response),
            },
            StatusCode::FORBIDDEN | StatusCode::GONE => GatewayOutcome::Banned {
                reason: format!("gateway returned HTTP {}", status.as_u16()),
            },
            _ => GatewayOutcome::TransportError {
                reason: format!("gateway returned HTTP {}", status.as_u16()),
            },
        }
    }

    async fn set_presence(&self, instance_id: &str, phone: &str, state: PresenceState) -> StepResult {
        self.post_presence(instance_id, phone, state, Duration::ZERO).await
    }

    async fn set_typing(&self, instance_id: &str, phone: &str, duration: Duration) -> StepResult {
        self.post_presence(instance_id, phone, PresenceState::Composing, duration).await
    }

    async fn connection_state(&self, instance_id: &str) -> Result<ConnectionState> {
        let response = self
            .client
            .get(self.url("instance/connectionState", instance_id))
            .header(API_KEY_HEADER, &self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::GONE {
            return Ok(ConnectionState::Banned);
        }
        if !status.is_success() {
            return Err(DispatchError::Transport(format!(
                "connection state probe returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: ConnectionStateResponse = response.json().await?;
        parse_connection_state(&body.instance.state).ok_or_else(|| {
            DispatchError::Transport(format!("unrecognized connection state '{}'", body.instance.state))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_state() {
        assert_eq!(parse_connection_state("open"), Some(ConnectionState::Open));
        assert_eq!(parse_connection_state("CLOSE"), Some(ConnectionState::Close));
        assert_eq!(parse_connection_state("refused"), None);
    }

    #[test]
    fn test_config_strips_trailing_slash() {
        let config = GatewayConfig {
            base_url: "http://gw:8080/".into(),
            api_key: "k".into(),
            timeout_ms: 2_000,
        };
        let http = HttpGatewayConfig::from(&config);
        assert_eq!(http.base_url, "http://gw:8080");
        assert_eq!(http.timeout, Duration::from_secs(2));
    }
}
