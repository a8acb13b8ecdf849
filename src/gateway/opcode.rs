//! Gateway opcodes.

/// Opcodes of gateway frames in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GatewayOpcode {
    /// Receive: an event was dispatched.
    Dispatch = 0,
    /// Send/receive: keeps the connection alive.
    Heartbeat = 1,
    /// Send: starts a new session.
    Identify = 2,
    /// Send: update presence.
    PresenceUpdate = 3,
    /// Send: join, leave or move between voice channels.
    VoiceStateUpdate = 4,
    /// Send: resume a previous session.
    Resume = 6,
    /// Receive: reconnect to the gateway.
    Reconnect = 7,
    /// Send: request guild members.
    RequestGuildMembers = 8,
    /// Receive: session invalidated; `d` says whether it is resumable.
    InvalidSession = 9,
    /// Receive: sent right after connecting.
    Hello = 10,
    /// Receive: heartbeat acknowledged.
    HeartbeatAck = 11,
}

impl TryFrom<u8> for GatewayOpcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Dispatch),
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::Identify),
            3 => Ok(Self::PresenceUpdate),
            4 => Ok(Self::VoiceStateUpdate),
            6 => Ok(Self::Resume),
            7 => Ok(Self::Reconnect),
            8 => Ok(Self::RequestGuildMembers),
            9 => Ok(Self::InvalidSession),
            10 => Ok(Self::Hello),
            11 => Ok(Self::HeartbeatAck),
            _ => Err(()),
        }
    }
}
