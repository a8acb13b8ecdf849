//! Wire payload types the core itself consumes.
//!
//! Only the frames and bodies needed to run the rate limiter and the gateway
//! state machine live here; entity schemas are the caller's concern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A gateway frame, `{op, d, s, t}` in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Opcode.
    pub op: u8,

    /// Event data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,

    /// Sequence number, present on DISPATCH frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event name, present on DISPATCH frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// HELLO payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

/// The READY fields the session machine needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    /// API version.
    pub v: u8,

    /// Session id, required for resuming.
    pub session_id: String,

    /// Gateway URL to use when resuming this session.
    pub resume_gateway_url: String,
}

/// IDENTIFY payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    /// Bot token.
    pub token: String,

    /// Connection properties.
    pub properties: IdentifyProperties,

    /// Gateway intents bitmask.
    pub intents: u64,

    /// `[shard_id, shard_count]`.
    pub shard: [u16; 2],

    /// Payload compression, orthogonal to transport compression.
    pub compress: bool,

    /// Member count above which guilds stop sending offline members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,

    /// Initial presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// IDENTIFY connection properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// Operating system.
    pub os: String,

    /// Library name.
    pub browser: String,

    /// Library name.
    pub device: String,
}

/// RESUME payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    /// Bot token.
    pub token: String,

    /// Session id from READY.
    pub session_id: String,

    /// Last received sequence number.
    pub seq: u64,
}

/// VOICE_STATE_UPDATE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    /// Guild to act in.
    pub guild_id: String,

    /// Channel to join, or `None` to disconnect.
    pub channel_id: Option<String>,

    /// Whether the bot is muted.
    #[serde(default)]
    pub self_mute: bool,

    /// Whether the bot is deafened.
    #[serde(default)]
    pub self_deaf: bool,
}

/// REQUEST_GUILD_MEMBERS payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    /// Guild to request members for.
    pub guild_id: String,

    /// Username prefix filter. An empty string matches all members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Maximum members to return. Zero means no limit.
    #[serde(default)]
    pub limit: u32,

    /// Whether to include presences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,

    /// Specific user ids to request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,

    /// Nonce echoed back in GUILD_MEMBERS_CHUNK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Response body of `GET /gateway`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetGateway {
    /// WebSocket URL to connect to.
    pub url: String,
}

/// Response body of `GET /gateway/bot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetGatewayBot {
    /// WebSocket URL to connect to.
    pub url: String,

    /// Recommended shard count.
    pub shards: u16,

    /// Session start limits for this bot.
    pub session_start_limit: SessionStartLimit,
}

/// Session start limits returned by `GET /gateway/bot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartLimit {
    /// Total session starts allowed per reset period.
    pub total: u32,

    /// Session starts remaining.
    pub remaining: u32,

    /// Milliseconds until the limit resets.
    pub reset_after: u64,

    /// How many shards may IDENTIFY concurrently.
    pub max_concurrency: u16,
}
