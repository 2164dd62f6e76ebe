//! Call waiting timeout guard
//!
//! CDMA networks give no indication that a waiting call was abandoned or that a
//! reject succeeded. The guard simulates it: if a waiting call is not answered
//! within the timeout, the controller treats it as missed.

use std::time::Duration;

use tracing::debug;

use crate::core::dispatcher::{ConnectionEvent, EventDispatcher, TimerHandle};
use crate::Result;

/// Default time a waiting call may stay unanswered
pub const CALL_WAITING_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug)]
struct ArmedDeadline {
    generation: u64,
    timer: TimerHandle,
}

/// Holds at most one missed-call deadline
#[derive(Debug)]
pub struct CallWaitingGuard {
    timeout: Duration,
    generation: u64,
    armed: Option<ArmedDeadline>,
}

impl CallWaitingGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            generation: 0,
            armed: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Schedule the missed-call deadline, replacing any earlier one.
    pub fn arm(&mut self, dispatcher: &EventDispatcher) -> Result<()> {
        self.disarm();
        self.generation += 1;
        let timer = dispatcher.post_delayed(
            ConnectionEvent::CallWaitingMissed {
                generation: self.generation,
            },
            self.timeout,
        )?;
        debug!(
            "call waiting timer armed for connection {} ({:?})",
            dispatcher.connection_id(),
            self.timeout
        );
        self.armed = Some(ArmedDeadline {
            generation: self.generation,
            timer,
        });
        Ok(())
    }

    /// Cancel the pending deadline. Returns whether one was armed.
    pub fn disarm(&mut self) -> bool {
        match self.armed.take() {
            Some(deadline) => {
                deadline.timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Consume a fired deadline. Stale generations (disarmed or re-armed
    /// after the timer already posted) are rejected.
    pub fn expire(&mut self, generation: u64) -> bool {
        match &self.armed {
            Some(deadline) if deadline.generation == generation => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Default for CallWaitingGuard {
    fn default() -> Self {
        Self::new(CALL_WAITING_TIMEOUT)
    }
}
