use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// One STUN or TURN server. TURN entries carry credentials.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallEngineConfig {
    /// Unanswered outgoing calls are cancelled after this many seconds.
    pub outgoing_timeout_secs: u64,
    /// Delay between entering `Error` and the automatic reset.
    pub error_reset_delay_ms: u64,
    pub ice_servers: Vec<IceServerConfig>,
    /// Hold remote candidates until a remote description is applied.
    pub buffer_early_candidates: bool,
}

impl CallEngineConfig {
    pub fn outgoing_timeout(&self) -> Duration {
        Duration::from_secs(self.outgoing_timeout_secs)
    }

    pub fn error_reset_delay(&self) -> Duration {
        Duration::from_millis(self.error_reset_delay_ms)
    }
}

impl Default for CallEngineConfig {
    fn default() -> Self {
        Self {
            outgoing_timeout_secs: 30,
            error_reset_delay_ms: 2000,
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)],
            buffer_early_candidates: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Websocket endpoint of the signaling hub.
    pub url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed attempts before giving up. Zero retries forever.
    pub max_reconnect_attempts: u32,
    pub request_timeout_secs: u64,
    /// How long a send waits for an in-flight connect before failing.
    pub connect_wait_secs: u64,
    pub keepalive_min_secs: u64,
    pub keepalive_max_secs: u64,
}

impl SignalingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// The URL to dial, with the access token appended as a query parameter.
    pub fn endpoint(&self) -> String {
        match &self.access_token {
            Some(token) if !token.is_empty() => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}access_token={}",
                    self.url,
                    sep,
                    urlencoding::encode(token)
                )
            }
            _ => self.url.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.connect_wait_secs)
    }

    /// Backoff before reconnect attempt `attempt` (1-based), doubling up to the cap.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000/hubs/call".to_string(),
            access_token: None,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            request_timeout_secs: 15,
            connect_wait_secs: 10,
            keepalive_min_secs: 15,
            keepalive_max_secs: 20,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    pub calls: CallEngineConfig,
}

impl ClientConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_json::from_str(raw)?)
    }
}
