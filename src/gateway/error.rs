//! Gateway failure kinds.
//!
//! The gateway never raises into user handler frames: fatal failures are
//! dispatched as values on the shard dispatcher's `critical` channel, which
//! is why this type is `Clone` and carries transport errors as strings.

use thiserror::Error;

use super::close_code::GatewayCloseCode;

/// Failures surfaced by [`super::Shard`] and [`super::ShardManager`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Close code 4004: the token is invalid.
    #[error("the token provided is invalid")]
    InvalidToken,

    /// Close code 4010: invalid shard id or count.
    #[error("invalid shard id or shard count")]
    InvalidShardCount,

    /// Close code 4012: this library speaks an API version Discord no longer
    /// accepts.
    #[error("invalid api version")]
    InvalidApiVersion,

    /// Close code 4013: the intents bitmask is malformed.
    #[error("the intents provided are invalid")]
    InvalidIntents,

    /// Close code 4014: intents not enabled for this bot. Enable them in the
    /// developer portal or apply for them.
    #[error("the intents provided are disallowed for this bot")]
    DisallowedIntents,

    /// A fatal close code with no dedicated kind.
    #[error("unhandled close code {0}")]
    UnhandledCloseCode(u16),

    /// A non-fatal disconnect, surfaced for observability.
    #[error("disconnected from the gateway (close code {code:?})")]
    Disconnect {
        /// Close code, if the peer sent one.
        code: Option<u16>,
    },

    /// Reconnecting was refused because reconnects are disabled. The shard
    /// is dead.
    #[error("reconnect check failed; this shard should be considered dead")]
    ReconnectCheckFailed,

    /// The shard was asked to connect twice.
    #[error("shard is already connected")]
    AlreadyConnected,

    /// A command was sent while no connection task is running.
    #[error("shard is not connected")]
    NotConnected,

    /// The outbound command gate or identify gate was closed.
    #[error("gateway rate limit gate closed")]
    GateClosed,

    /// A payload could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// The shard configuration is inconsistent.
    #[error("invalid shard configuration: {0}")]
    ShardConfig(String),

    /// The transport failed; carried as a string so this type stays `Clone`.
    #[error("websocket transport error: {0}")]
    Transport(String),

    /// The zlib context was corrupted; the connection had to be replaced.
    #[error("compression context corrupted: {0}")]
    Decompress(String),
}

impl GatewayError {
    /// The typed error for a fatal close code, or `None` when the close is
    /// recoverable by reconnecting.
    #[must_use]
    pub fn from_close_code(code: u16) -> Option<Self> {
        let known = GatewayCloseCode::from_code(code)?;
        if !known.is_fatal() {
            return None;
        }
        Some(match known {
            GatewayCloseCode::AuthenticationFailed => Self::InvalidToken,
            GatewayCloseCode::InvalidShard => Self::InvalidShardCount,
            GatewayCloseCode::InvalidApiVersion => Self::InvalidApiVersion,
            GatewayCloseCode::InvalidIntents => Self::InvalidIntents,
            GatewayCloseCode::DisallowedIntents => Self::DisallowedIntents,
            _ => Self::UnhandledCloseCode(code),
        })
    }
}
