//! Configuration management for Huddle Core

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub presence: PresenceConfig,
    pub typing: TypingConfig,
    pub calls: CallConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the REST endpoint, e.g. `https://project.example.co`
    pub rest_url: String,
    /// Websocket endpoint of the realtime relay
    pub realtime_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub online_threshold_secs: u64,
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    pub broadcast_interval_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub expiry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub heartbeat_interval_secs: u64,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }
}

impl PresenceConfig {
    pub fn online_threshold(&self) -> Duration {
        Duration::from_secs(self.online_threshold_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl TypingConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_threshold_secs: 300, // 5 minutes
            tick_interval_secs: 30,
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 1500,
            inactivity_timeout_ms: 2000,
            expiry_ms: 2500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                rest_url: "http://localhost:54321".to_string(),
                realtime_url: "ws://localhost:54321/realtime/v1/websocket".to_string(),
                api_key: "change-this-anon-key".to_string(),
            },
            presence: PresenceConfig::default(),
            typing: TypingConfig::default(),
            calls: CallConfig {
                ice_servers: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
            },
            realtime: RealtimeConfig {
                heartbeat_interval_secs: 25,
            },
        }
    }
}
