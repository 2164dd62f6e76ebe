//! DTMF (Dual-Tone Multi-Frequency) signalling
//!
//! A digit is either played as a continuous tone (start/stop pair) or sent to the
//! network as a short burst message. At most one burst may await confirmation;
//! digits requested meanwhile wait in a FIFO queue and are flushed as a single
//! string once the network confirms.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::dispatcher::EventDispatcher;
use crate::interfaces::{Bearer, RadioPhone};
use crate::{Error, Result};

/// Digit sent in place of any burst tone while local call hold is active
pub const LOCAL_HOLD_DIGIT: char = '#';

/// User-selectable DTMF tone type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtmfToneType {
    #[default]
    Normal,
    Long,
}

/// How a digit reaches the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtmfMode {
    /// Continuous start/stop tone, no queueing
    Continuous,
    /// Discrete burst message requiring confirmation
    Burst,
}

impl DtmfMode {
    /// Burst mode is used for normal tones on circuit switched legs only.
    pub fn select(bearer: Bearer, tone_type: Option<DtmfToneType>) -> Self {
        if bearer == Bearer::PacketVoice {
            debug!("packet voice bearer, burst dtmf unavailable");
            return DtmfMode::Continuous;
        }
        match tone_type.unwrap_or_default() {
            DtmfToneType::Normal => DtmfMode::Burst,
            DtmfToneType::Long => DtmfMode::Continuous,
        }
    }
}

/// Normalise a keypad digit (`0-9`, `*`, `#`, `A-D`).
pub fn validate_digit(digit: char) -> Result<char> {
    match digit.to_ascii_uppercase() {
        c @ ('0'..='9' | '*' | '#' | 'A'..='D') => Ok(c),
        _ => Err(Error::InvalidDigit),
    }
}

/// Result of a single tone request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneOutcome {
    /// Continuous tone started
    Started,
    /// Burst issued to the network
    BurstSent,
    /// Burst confirmation outstanding, digit queued
    Queued,
}

#[derive(Debug, Default)]
struct ToneQueue {
    digits: VecDeque<char>,
}

impl ToneQueue {
    fn push(&mut self, digit: char) {
        self.digits.push_back(digit);
    }

    fn drain(&mut self) -> Option<String> {
        if self.digits.is_empty() {
            return None;
        }
        Some(self.digits.drain(..).collect())
    }

    fn len(&self) -> usize {
        self.digits.len()
    }

    fn clear(&mut self) -> usize {
        let count = self.digits.len();
        self.digits.clear();
        count
    }
}

#[derive(Debug, Default)]
struct BurstState {
    queue: ToneQueue,
    confirmation_pending: bool,
}

/// Burst DTMF sender enforcing a single outstanding confirmation.
///
/// Clones share state, so a clone can be handed to a producer running outside
/// the connection's event loop.
#[derive(Debug, Clone, Default)]
pub struct ToneTransmitter {
    state: Arc<Mutex<BurstState>>,
    on_length_ms: u32,
    off_length_ms: u32,
}

impl ToneTransmitter {
    pub fn new(on_length_ms: u32, off_length_ms: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BurstState::default())),
            on_length_ms,
            off_length_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BurstState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Play `digit` in the given mode.
    pub fn play(
        &self,
        digit: char,
        mode: DtmfMode,
        phone: &dyn RadioPhone,
        dispatcher: &EventDispatcher,
    ) -> ToneOutcome {
        match mode {
            DtmfMode::Continuous => {
                info!("sending dtmf digit directly");
                phone.start_dtmf(digit);
                ToneOutcome::Started
            }
            DtmfMode::Burst => {
                info!("sending dtmf digit as burst");
                let digit = if phone.is_local_hold_active() {
                    LOCAL_HOLD_DIGIT
                } else {
                    digit
                };
                self.send_short(digit, phone, dispatcher)
            }
        }
    }

    /// Only continuous tones have anything to stop.
    pub fn stop(&self, mode: DtmfMode, phone: &dyn RadioPhone) {
        if mode == DtmfMode::Continuous {
            phone.stop_dtmf();
        }
    }

    fn send_short(
        &self,
        digit: char,
        phone: &dyn RadioPhone,
        dispatcher: &EventDispatcher,
    ) -> ToneOutcome {
        let mut state = self.lock();
        if state.confirmation_pending {
            state.queue.push(digit);
            debug!("burst dtmf confirmation pending, {} digit[s] queued", state.queue.len());
            ToneOutcome::Queued
        } else {
            self.send_burst_locked(&mut state, &digit.to_string(), phone, dispatcher);
            ToneOutcome::BurstSent
        }
    }

    fn send_burst_locked(
        &self,
        state: &mut BurstState,
        digits: &str,
        phone: &dyn RadioPhone,
        dispatcher: &EventDispatcher,
    ) {
        phone.send_burst_dtmf(
            digits,
            self.on_length_ms,
            self.off_length_ms,
            dispatcher.burst_confirmation(),
        );
        state.confirmation_pending = true;
    }

    /// Handle a burst confirmation: flush the whole queue as the next burst.
    ///
    /// Returns the number of digits flushed.
    pub fn on_confirmation(
        &self,
        phone: Option<&dyn RadioPhone>,
        dispatcher: &EventDispatcher,
    ) -> usize {
        let mut state = self.lock();
        state.confirmation_pending = false;

        let Some(digits) = state.queue.drain() else {
            return 0;
        };
        // Digit values stay out of the logs; they may be passwords.
        info!("{} dtmf character[s] removed from the queue", digits.len());

        match phone {
            Some(phone) => self.send_burst_locked(&mut state, &digits, phone, dispatcher),
            None => warn!(
                "no phone available, dropping {} queued dtmf character[s]",
                digits.len()
            ),
        }
        digits.len()
    }

    /// Drop all queued digits and forget any outstanding confirmation.
    pub fn discard(&self) -> usize {
        let mut state = self.lock();
        state.confirmation_pending = false;
        state.queue.clear()
    }

    pub fn pending_digits(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_confirmation_pending(&self) -> bool {
        self.lock().confirmation_pending
    }
}
