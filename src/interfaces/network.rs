//! Radio network collaborators
//!
//! The controller never talks to the modem directly. It sees the call leg as a
//! [`NetworkConnection`] and the radio as a [`RadioPhone`]; both are fire-and-forget,
//! with completions delivered later through the connection's event dispatcher.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::dispatcher::{BurstConfirmation, LineStatusSubscriber};
use crate::core::state::ConnectionId;
use crate::Result;

/// Call leg state as reported by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Active,
    Holding,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Disconnected,
    Disconnecting,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Transport carrying the call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bearer {
    #[default]
    CircuitSwitched,
    /// IMS-style packet voice; no burst DTMF, conference capable
    PacketVoice,
}

/// The underlying call leg
pub trait NetworkConnection: Send + Sync {
    fn state(&self) -> CallState;

    fn is_incoming(&self) -> bool;

    /// Time elapsed since the leg was connected
    fn duration(&self) -> Duration;

    /// Remote party address, possibly with a `tel:` scheme
    fn address(&self) -> String;

    fn bearer(&self) -> Bearer;

    /// Release the leg. Fails with [`crate::Error::CallState`] when it is already gone.
    fn hangup(&self) -> Result<()>;

    /// Re-baseline the recorded connect time to now
    fn reset_connection_time(&self);

    /// Radio the leg belongs to, if still attached
    fn phone(&self) -> Option<Arc<dyn RadioPhone>>;
}

/// The radio serving a call leg
pub trait RadioPhone: Send + Sync {
    fn phone_id(&self) -> u32;

    fn start_dtmf(&self, digit: char);

    fn stop_dtmf(&self);

    /// Send `digits` as one burst message; `confirmation` is completed by the network.
    fn send_burst_dtmf(
        &self,
        digits: &str,
        on_length_ms: u32,
        off_length_ms: u32,
        confirmation: BurstConfirmation,
    );

    fn register_for_line_control_info(&self, subscriber: LineStatusSubscriber);

    fn unregister_for_line_control_info(&self, connection_id: ConnectionId);

    /// Whether a companion connection's signal path is administratively held
    fn is_local_hold_active(&self) -> bool;

    fn accept_call(&self) -> Result<()>;

    fn conference(&self) -> Result<()>;
}
