//! Event dispatch for a single connection controller
//!
//! Timer deadlines, burst DTMF confirmations and line control records all
//! travel through one unbounded channel owned by the controller, which drains
//! it sequentially. Nothing here blocks: network collaborators hold cheap
//! tokens that post back into the channel when their operation completes.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::state::ConnectionId;
use crate::{Error, Result};

/// Messages delivered to a connection controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The call waiting deadline armed as `generation` elapsed
    CallWaitingMissed { generation: u64 },
    /// The network acknowledged the outstanding burst DTMF send
    BurstDtmfConfirmed,
    /// A line control information record arrived from the network
    LineControlInfo,
}

/// Per-connection scheduling primitive
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl EventDispatcher {
    pub fn new(connection_id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            connection_id,
            tx,
            shutdown: CancellationToken::new(),
        };
        (dispatcher, rx)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Deliver `event` after `delay` unless the returned handle is cancelled first.
    ///
    /// Fails outside a tokio runtime.
    pub fn post_delayed(&self, event: ConnectionEvent, delay: Duration) -> Result<TimerHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::invalid_state(format!("No runtime for timer: {}", e)))?;
        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let connection_id = self.connection_id;

        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    trace!("Timer for connection {} cancelled", connection_id);
                }
                _ = tokio::time::sleep(delay) => {
                    post_unless_shut_down(&tx, &shutdown, event);
                }
            }
        });

        Ok(TimerHandle { token })
    }

    /// Token handed to the network with a burst DTMF send
    pub fn burst_confirmation(&self) -> BurstConfirmation {
        BurstConfirmation {
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Subscription handle for line control information records
    pub fn line_status_subscriber(&self) -> LineStatusSubscriber {
        LineStatusSubscriber {
            connection_id: self.connection_id,
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Stop accepting events. Pending timers are cancelled with it.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

fn post_unless_shut_down(
    tx: &mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: &CancellationToken,
    event: ConnectionEvent,
) -> bool {
    if shutdown.is_cancelled() {
        return false;
    }
    tx.send(event).is_ok()
}

/// Handle to a pending delayed event
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Completion token for one burst DTMF send
#[derive(Debug)]
pub struct BurstConfirmation {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl BurstConfirmation {
    /// Report that the network accepted the burst. No-op after the connection closed.
    pub fn confirm(self) -> bool {
        post_unless_shut_down(&self.tx, &self.shutdown, ConnectionEvent::BurstDtmfConfirmed)
    }
}

/// Line control record subscription held by the network
#[derive(Debug, Clone)]
pub struct LineStatusSubscriber {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl LineStatusSubscriber {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn notify(&self) -> bool {
        post_unless_shut_down(&self.tx, &self.shutdown, ConnectionEvent::LineControlInfo)
    }
}
