// Engine configuration
// Loaded from a JSON file in the user's config directory, with environment overrides

use anyhow::{anyhow, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the broker URL
pub const BROKER_URL_ENV: &str = "CHAT_BROKER_URL";

const CONFIG_DIR_NAME: &str = "chat-sync";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket endpoint of the STOMP broker; `?userId=<id>` is appended on connect
    pub broker_url: String,
    /// First reconnect delay; doubles on every consecutive failure
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Silence after the last local keystroke before typing=false is sent
    pub typing_idle_ms: u64,
    /// Fallback expiry for a remote typing=true that is never retracted
    pub remote_typing_ttl_ms: u64,
    pub heartbeat_ms: u64,
    pub connect_timeout_ms: u64,
    pub history_page_size: u32,
    /// Send a delivered receipt for every SENT message addressed to us
    pub auto_ack_delivery: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            broker_url: "ws://localhost:8080/ws/websocket".to_string(),
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            typing_idle_ms: 2000,
            remote_typing_ttl_ms: 5000,
            heartbeat_ms: 4000,
            connect_timeout_ms: 10_000,
            history_page_size: 50,
            auto_ack_delivery: true,
        }
    }
}

impl SyncConfig {
    /// Load the configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file yields the defaults. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let mut file = File::open(&path)?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let config: SyncConfig = serde_json::from_str(&contents)
                .map_err(|e| anyhow!("Invalid config file {}: {}", path.display(), e))?;
            info!("Loaded sync configuration from {}", path.display());
            config
        } else {
            debug!("No config file at {}, using defaults", path.display());
            SyncConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var(BROKER_URL_ENV) {
            if !url.trim().is_empty() {
                info!("Broker URL overridden by {}", BROKER_URL_ENV);
                self.broker_url = url.trim().to_string();
            }
        }
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn remote_typing_ttl(&self) -> Duration {
        Duration::from_millis(self.remote_typing_ttl_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(CONFIG_DIR_NAME);
    Ok(dir.join(CONFIG_FILE_NAME))
}
