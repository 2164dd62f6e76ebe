//! Connection identity, lifecycle states and upward notifications

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one connection controller instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call direction as seen from the local subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Call-control lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Dialing,
    Ringing,
    Active,
    Holding,
    Disconnected,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "NEW",
            ConnectionState::Dialing => "DIALING",
            ConnectionState::Ringing => "RINGING",
            ConnectionState::Active => "ACTIVE",
            ConnectionState::Holding => "HOLDING",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Reason attached to the terminal DISCONNECTED state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// Remote or network initiated clearing
    Normal,
    /// Cleared locally outside the ringing/waiting flows
    Local,
    /// Waiting call was never answered
    IncomingMissed,
    /// Ringing or waiting call was rejected by the user
    IncomingRejected,
}

impl DisconnectCause {
    pub fn description(&self) -> &'static str {
        match self {
            DisconnectCause::Normal => "normal clearing",
            DisconnectCause::Local => "local disconnect",
            DisconnectCause::IncomingMissed => "incoming call missed",
            DisconnectCause::IncomingRejected => "incoming call rejected",
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Call capability bit set reported to the call-control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const SUPPORT_HOLD: Self = Self(1 << 1);
    pub const MERGE_CONFERENCE: Self = Self(1 << 2);
    pub const MUTE: Self = Self(1 << 6);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Notifications delivered upward to the call-control layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallControlEvent {
    StateChanged {
        connection_id: ConnectionId,
        state: ConnectionState,
    },
    Disconnected {
        connection_id: ConnectionId,
        cause: DisconnectCause,
    },
    Closed {
        connection_id: ConnectionId,
    },
}
