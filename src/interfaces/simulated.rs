//! In-process simulated radio network
//!
//! Records every outbound network action so scenarios and tests can inspect
//! what the controller did, and lets the caller decide when bursts are
//! confirmed and when line control records arrive.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::network::{Bearer, CallState, NetworkConnection, RadioPhone};
use super::platform::EmergencyTonePlayer;
use crate::core::dispatcher::{BurstConfirmation, LineStatusSubscriber};
use crate::core::state::ConnectionId;
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outbound request observed by the simulated radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NetworkAction {
    StartDtmf { digit: char },
    StopDtmf,
    BurstDtmf {
        digits: String,
        on_length_ms: u32,
        off_length_ms: u32,
    },
    RegisterLineControl { connection_id: ConnectionId },
    UnregisterLineControl { connection_id: ConnectionId },
    AcceptCall,
    Conference,
}

impl fmt::Display for NetworkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkAction::StartDtmf { .. } => write!(f, "start continuous dtmf"),
            NetworkAction::StopDtmf => write!(f, "stop continuous dtmf"),
            NetworkAction::BurstDtmf { digits, .. } => {
                write!(f, "burst dtmf ({} character[s])", digits.len())
            }
            NetworkAction::RegisterLineControl { connection_id } => {
                write!(f, "register line control info for {}", connection_id)
            }
            NetworkAction::UnregisterLineControl { connection_id } => {
                write!(f, "unregister line control info for {}", connection_id)
            }
            NetworkAction::AcceptCall => write!(f, "accept call"),
            NetworkAction::Conference => write!(f, "conference"),
        }
    }
}

/// Simulated radio
#[derive(Debug)]
pub struct SimulatedPhone {
    phone_id: u32,
    actions: Mutex<Vec<NetworkAction>>,
    confirmations: Mutex<VecDeque<BurstConfirmation>>,
    line_control: DashMap<ConnectionId, LineStatusSubscriber>,
    local_hold: AtomicBool,
    confirm_delay: Option<Duration>,
}

impl SimulatedPhone {
    /// Radio that holds burst confirmations until [`Self::confirm_next_burst`].
    pub fn new(phone_id: u32) -> Self {
        Self {
            phone_id,
            actions: Mutex::new(Vec::new()),
            confirmations: Mutex::new(VecDeque::new()),
            line_control: DashMap::new(),
            local_hold: AtomicBool::new(false),
            confirm_delay: None,
        }
    }

    /// Radio that confirms every burst by itself after `delay`.
    /// Bursts must then be sent from within a tokio runtime.
    pub fn with_confirm_delay(phone_id: u32, delay: Duration) -> Self {
        Self {
            confirm_delay: Some(delay),
            ..Self::new(phone_id)
        }
    }

    fn record(&self, action: NetworkAction) {
        debug!("phone {}: {}", self.phone_id, action);
        lock(&self.actions).push(action);
    }

    pub fn actions(&self) -> Vec<NetworkAction> {
        lock(&self.actions).clone()
    }

    pub fn burst_sends(&self) -> Vec<String> {
        lock(&self.actions)
            .iter()
            .filter_map(|action| match action {
                NetworkAction::BurstDtmf { digits, .. } => Some(digits.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn burst_timings(&self) -> Vec<(u32, u32)> {
        lock(&self.actions)
            .iter()
            .filter_map(|action| match action {
                NetworkAction::BurstDtmf {
                    on_length_ms,
                    off_length_ms,
                    ..
                } => Some((*on_length_ms, *off_length_ms)),
                _ => None,
            })
            .collect()
    }

    pub fn started_tones(&self) -> Vec<char> {
        lock(&self.actions)
            .iter()
            .filter_map(|action| match action {
                NetworkAction::StartDtmf { digit } => Some(*digit),
                _ => None,
            })
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        self.count(|action| matches!(action, NetworkAction::StopDtmf))
    }

    pub fn accept_count(&self) -> usize {
        self.count(|action| matches!(action, NetworkAction::AcceptCall))
    }

    pub fn conference_count(&self) -> usize {
        self.count(|action| matches!(action, NetworkAction::Conference))
    }

    fn count<F: Fn(&NetworkAction) -> bool>(&self, predicate: F) -> usize {
        lock(&self.actions).iter().filter(|action| predicate(*action)).count()
    }

    /// Complete the oldest outstanding burst. Returns false when none is held.
    pub fn confirm_next_burst(&self) -> bool {
        let confirmation = lock(&self.confirmations).pop_front();
        match confirmation {
            Some(confirmation) => {
                confirmation.confirm();
                true
            }
            None => false,
        }
    }

    pub fn pending_confirmations(&self) -> usize {
        lock(&self.confirmations).len()
    }

    pub fn set_local_hold_active(&self, active: bool) {
        self.local_hold.store(active, Ordering::SeqCst);
    }

    /// Deliver a line control record to every subscribed connection.
    pub fn broadcast_line_control_info(&self) -> usize {
        self.line_control
            .iter()
            .filter(|entry| entry.value().notify())
            .count()
    }

    pub fn is_line_control_registered(&self, connection_id: ConnectionId) -> bool {
        self.line_control.contains_key(&connection_id)
    }

    pub fn line_control_subscribers(&self) -> usize {
        self.line_control.len()
    }
}

impl RadioPhone for SimulatedPhone {
    fn phone_id(&self) -> u32 {
        self.phone_id
    }

    fn start_dtmf(&self, digit: char) {
        self.record(NetworkAction::StartDtmf { digit });
    }

    fn stop_dtmf(&self) {
        self.record(NetworkAction::StopDtmf);
    }

    fn send_burst_dtmf(
        &self,
        digits: &str,
        on_length_ms: u32,
        off_length_ms: u32,
        confirmation: BurstConfirmation,
    ) {
        self.record(NetworkAction::BurstDtmf {
            digits: digits.to_string(),
            on_length_ms,
            off_length_ms,
        });

        match self.confirm_delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    confirmation.confirm();
                });
            }
            None => lock(&self.confirmations).push_back(confirmation),
        }
    }

    fn register_for_line_control_info(&self, subscriber: LineStatusSubscriber) {
        let connection_id = subscriber.connection_id();
        self.record(NetworkAction::RegisterLineControl { connection_id });
        self.line_control.insert(connection_id, subscriber);
    }

    fn unregister_for_line_control_info(&self, connection_id: ConnectionId) {
        self.record(NetworkAction::UnregisterLineControl { connection_id });
        self.line_control.remove(&connection_id);
    }

    fn is_local_hold_active(&self) -> bool {
        self.local_hold.load(Ordering::SeqCst)
    }

    fn accept_call(&self) -> Result<()> {
        self.record(NetworkAction::AcceptCall);
        Ok(())
    }

    fn conference(&self) -> Result<()> {
        self.record(NetworkAction::Conference);
        Ok(())
    }
}

/// Simulated call leg
#[derive(Debug)]
pub struct SimulatedConnection {
    state: RwLock<CallState>,
    incoming: bool,
    bearer: Bearer,
    address: String,
    connected_at: RwLock<Option<Instant>>,
    phone: Option<Arc<SimulatedPhone>>,
    fail_hangup: AtomicBool,
    hangups: AtomicUsize,
    time_resets: AtomicUsize,
}

impl SimulatedConnection {
    fn build(
        address: &str,
        incoming: bool,
        state: CallState,
        bearer: Bearer,
        phone: Option<Arc<SimulatedPhone>>,
    ) -> Self {
        Self {
            state: RwLock::new(state),
            incoming,
            bearer,
            address: address.to_string(),
            connected_at: RwLock::new(None),
            phone,
            fail_hangup: AtomicBool::new(false),
            hangups: AtomicUsize::new(0),
            time_resets: AtomicUsize::new(0),
        }
    }

    pub fn outgoing(address: &str, phone: Option<Arc<SimulatedPhone>>) -> Self {
        Self::build(address, false, CallState::Dialing, Bearer::CircuitSwitched, phone)
    }

    pub fn incoming(address: &str, phone: Option<Arc<SimulatedPhone>>) -> Self {
        Self::build(address, true, CallState::Incoming, Bearer::CircuitSwitched, phone)
    }

    pub fn waiting(address: &str, phone: Option<Arc<SimulatedPhone>>) -> Self {
        Self::build(address, true, CallState::Waiting, Bearer::CircuitSwitched, phone)
    }

    pub fn with_bearer(mut self, bearer: Bearer) -> Self {
        self.bearer = bearer;
        self
    }

    /// Entering `Active` for the first time starts the duration clock.
    pub fn set_state(&self, state: CallState) {
        *self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
        if state == CallState::Active {
            let mut connected_at = self
                .connected_at
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if connected_at.is_none() {
                *connected_at = Some(Instant::now());
            }
        }
    }

    /// Make subsequent hangups fail as if the leg were already gone.
    pub fn set_fail_hangup(&self, fail: bool) {
        self.fail_hangup.store(fail, Ordering::SeqCst);
    }

    pub fn hangups(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }

    pub fn time_resets(&self) -> usize {
        self.time_resets.load(Ordering::SeqCst)
    }
}

impl NetworkConnection for SimulatedConnection {
    fn state(&self) -> CallState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn duration(&self) -> Duration {
        self.connected_at
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|connected_at| connected_at.elapsed())
            .unwrap_or_default()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn bearer(&self) -> Bearer {
        self.bearer
    }

    fn hangup(&self) -> Result<()> {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        if self.fail_hangup.load(Ordering::SeqCst) {
            return Err(Error::call_state("call leg already disconnected"));
        }
        self.set_state(CallState::Disconnected);
        Ok(())
    }

    fn reset_connection_time(&self) {
        self.time_resets.fetch_add(1, Ordering::SeqCst);
        *self
            .connected_at
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    fn phone(&self) -> Option<Arc<dyn RadioPhone>> {
        self.phone
            .as_ref()
            .map(|phone| Arc::clone(phone) as Arc<dyn RadioPhone>)
    }
}

/// Emergency cue that only counts start/stop requests
#[derive(Debug, Default)]
pub struct SimulatedTonePlayer {
    playing: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl SimulatedTonePlayer {
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl EmergencyTonePlayer for SimulatedTonePlayer {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.playing.swap(true, Ordering::SeqCst) {
            debug!("emergency tone started");
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.playing.swap(false, Ordering::SeqCst) {
            debug!("emergency tone stopped");
        }
    }
}
