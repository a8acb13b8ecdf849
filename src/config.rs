//! Engine and shard-manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`crate::http::HttpEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URL for the Discord API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,

    /// Retry behavior for transport and server errors.
    #[serde(default)]
    pub retry: RetryConfig,

    /// How many times a request is requeued after a 429 before giving up.
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Requests per second admitted by the global rate limiter.
    ///
    /// `None` selects the unlimited variant for bots whose global limit has
    /// been lifted by Discord.
    #[serde(default = "default_global_limit")]
    pub global_limit: Option<u32>,
}

fn default_base_url() -> String {
    "https://discord.com/api/v10".into()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_rate_limit_retries() -> u32 {
    10
}

fn default_global_limit() -> Option<u32> {
    Some(50)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_timeout(),
            retry: RetryConfig::default(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            global_limit: default_global_limit(),
        }
    }
}

/// Retry configuration for transport failures and 5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Options for [`crate::gateway::ShardManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardManagerOptions {
    /// Bot token from the Discord Developer Portal.
    pub token: String,

    /// Gateway intents bitmask.
    #[serde(default)]
    pub intents: u64,

    /// Shard count. When unset it is fetched from `/gateway/bot`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<u16>,

    /// Shard ids to spawn. Requires `shard_count`; defaults to all ids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_ids: Option<Vec<u16>>,

    /// Initial presence sent with IDENTIFY.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,

    /// Member count above which guilds stop sending offline members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,

    /// Library name reported in the IDENTIFY properties.
    #[serde(default = "default_library_name")]
    pub library_name: String,
}

fn default_library_name() -> String {
    env!("CARGO_PKG_NAME").into()
}

impl Default for ShardManagerOptions {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: 0,
            shard_count: None,
            shard_ids: None,
            presence: None,
            large_threshold: None,
            library_name: default_library_name(),
        }
    }
}
