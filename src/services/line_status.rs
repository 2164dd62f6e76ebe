//! Line control record handling
//!
//! The first line control record seen on an established outgoing call marks the
//! point the far end actually answered, so the connect time is re-baselined once.

use tracing::info;

use crate::interfaces::{CallState, NetworkConnection};

#[derive(Debug, Default)]
pub struct LineStatusDebouncer {
    connection_time_reset: bool,
}

impl LineStatusDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this event performed the duration correction.
    pub fn on_line_status_event(&mut self, connection: &dyn NetworkConnection) -> bool {
        if self.connection_time_reset || connection.state() != CallState::Active {
            return false;
        }
        if connection.duration().is_zero() || connection.is_incoming() {
            return false;
        }

        self.connection_time_reset = true;
        connection.reset_connection_time();
        info!("connection time re-baselined on line control info");
        true
    }

    pub fn has_reset(&self) -> bool {
        self.connection_time_reset
    }

    pub fn reset(&mut self) {
        self.connection_time_reset = false;
    }
}
