//! Gateway close codes and their consequences.

/// A gateway close code in the 4xxx range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum GatewayCloseCode {
    /// An unknown error occurred.
    UnknownError = 4000,
    /// We sent an invalid opcode.
    UnknownOpcode = 4001,
    /// We sent an invalid payload.
    DecodeError = 4002,
    /// We sent a payload before authenticating.
    NotAuthenticated = 4003,
    /// We sent an invalid token.
    AuthenticationFailed = 4004,
    /// We sent IDENTIFY or RESUME more than once.
    AlreadyAuthenticated = 4005,
    /// We resumed with an invalid sequence number.
    InvalidSequence = 4007,
    /// We sent payloads too fast.
    RateLimited = 4008,
    /// The session timed out.
    SessionTimeout = 4009,
    /// We sent an invalid shard id, or the shard count is too low.
    InvalidShard = 4010,
    /// Sharding is required to connect.
    ShardingRequired = 4011,
    /// We sent an invalid API version.
    InvalidApiVersion = 4012,
    /// We sent invalid intents.
    InvalidIntents = 4013,
    /// We sent intents we are not allowed to use.
    DisallowedIntents = 4014,
}

impl GatewayCloseCode {
    /// Look up a known close code.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimeout),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    /// Whether this close ends the shard for good.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    /// Whether reconnecting must start a fresh session instead of resuming.
    #[must_use]
    pub const fn clears_session(self) -> bool {
        matches!(self, Self::InvalidSequence | Self::SessionTimeout)
    }
}
