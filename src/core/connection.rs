//! CDMA connection controller
//!
//! Owns the protocol state of one call leg: burst DTMF transmission, the
//! simulated call waiting timeout, the one-shot connect time correction on
//! line control records and the emergency tone cue. All mutation happens on
//! the controller's own event loop; network completions arrive as
//! [`ConnectionEvent`]s through its [`EventDispatcher`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::dispatcher::{ConnectionEvent, EventDispatcher};
use super::state::{
    CallControlEvent, CallDirection, Capabilities, ConnectionId, ConnectionState, DisconnectCause,
};
use crate::config::ControllerConfig;
use crate::interfaces::{
    Bearer, CallState, EmergencyNumberClassifier, EmergencyTonePlayer, NetworkConnection,
    RadioPhone, SettingsProvider,
};
use crate::protocols::dtmf::{validate_digit, DtmfMode, ToneOutcome, ToneTransmitter};
use crate::services::call_waiting::{CallWaitingGuard, CALL_WAITING_TIMEOUT};
use crate::services::line_status::LineStatusDebouncer;
use crate::Result;

/// Platform collaborators shared by a connection and its clones
#[derive(Clone)]
pub struct ConnectionContext {
    pub settings: Arc<dyn SettingsProvider>,
    pub emergency_numbers: Arc<dyn EmergencyNumberClassifier>,
    pub emergency_tone_player: Option<Arc<dyn EmergencyTonePlayer>>,
}

/// Per-connection construction options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub direction: CallDirection,
    pub allow_mute: bool,
    pub call_waiting_timeout: Duration,
    pub burst_on_length_ms: u32,
    pub burst_off_length_ms: u32,
}

impl ConnectionOptions {
    pub fn from_config(config: &ControllerConfig, direction: CallDirection) -> Self {
        Self {
            direction,
            allow_mute: config.connection.allow_mute,
            call_waiting_timeout: config.call_waiting.timeout(),
            burst_on_length_ms: config.dtmf.burst_on_length_ms,
            burst_off_length_ms: config.dtmf.burst_off_length_ms,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            direction: CallDirection::Outgoing,
            allow_mute: false,
            call_waiting_timeout: CALL_WAITING_TIMEOUT,
            burst_on_length_ms: 0,
            burst_off_length_ms: 0,
        }
    }
}

/// Serializable view of a connection's protocol state
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub direction: CallDirection,
    pub bearer: Bearer,
    pub is_call_waiting: bool,
    pub queued_tones: usize,
    pub tone_confirmation_pending: bool,
    pub call_waiting_timer_armed: bool,
    pub connection_time_reset: bool,
    pub disconnect_cause: Option<DisconnectCause>,
    pub capabilities: u32,
    pub closed: bool,
    pub created_at: DateTime<Utc>,
}

/// A single call leg handled over CDMA
pub struct CdmaConnection {
    id: ConnectionId,
    original: Option<Arc<dyn NetworkConnection>>,
    context: ConnectionContext,
    options: ConnectionOptions,
    state: ConnectionState,
    disconnect_cause: Option<DisconnectCause>,
    is_call_waiting: bool,
    tones: ToneTransmitter,
    call_waiting: CallWaitingGuard,
    line_status: LineStatusDebouncer,
    dispatcher: EventDispatcher,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    listener_tx: mpsc::UnboundedSender<CallControlEvent>,
    listener_rx: Option<mpsc::UnboundedReceiver<CallControlEvent>>,
    created_at: DateTime<Utc>,
    closed: bool,
}

impl CdmaConnection {
    /// Create a controller bound to `original`.
    ///
    /// A circuit switched leg that starts out waiting arms the call waiting
    /// timer, which fails outside a tokio runtime.
    pub fn new(
        original: Option<Arc<dyn NetworkConnection>>,
        context: ConnectionContext,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let mut connection = Self::build(original, context, options);
        if connection.is_call_waiting && !connection.is_packet_voice() {
            connection.call_waiting.arm(&connection.dispatcher)?;
        }
        Ok(connection)
    }

    fn build(
        original: Option<Arc<dyn NetworkConnection>>,
        context: ConnectionContext,
        options: ConnectionOptions,
    ) -> Self {
        let id = ConnectionId::new();
        let (dispatcher, event_rx) = EventDispatcher::new(id);
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();

        let mut connection = Self {
            id,
            original: None,
            context,
            options,
            state: ConnectionState::New,
            disconnect_cause: None,
            is_call_waiting: false,
            tones: ToneTransmitter::new(options.burst_on_length_ms, options.burst_off_length_ms),
            call_waiting: CallWaitingGuard::new(options.call_waiting_timeout),
            line_status: LineStatusDebouncer::new(),
            dispatcher,
            event_rx: Some(event_rx),
            listener_tx,
            listener_rx: Some(listener_rx),
            created_at: Utc::now(),
            closed: false,
        };

        if let Some(original) = original {
            connection.set_original_connection(original);
        }
        connection.is_call_waiting = connection.original_state() == Some(CallState::Waiting);
        debug!(
            "Created connection {} ({:?}, waiting: {})",
            id, options.direction, connection.is_call_waiting
        );
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn direction(&self) -> CallDirection {
        self.options.direction
    }

    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        self.disconnect_cause
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_call_waiting(&self) -> bool {
        self.is_call_waiting
    }

    pub fn original_connection(&self) -> Option<&Arc<dyn NetworkConnection>> {
        self.original.as_ref()
    }

    /// Protocol events for [`run_event_loop`]. Can be taken once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    /// Notifications for the call-control layer. Can be taken once.
    pub fn take_listener_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<CallControlEvent>> {
        self.listener_rx.take()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    fn phone(&self) -> Option<Arc<dyn RadioPhone>> {
        self.original.as_ref().and_then(|original| original.phone())
    }

    fn original_state(&self) -> Option<CallState> {
        self.original.as_ref().map(|original| original.state())
    }

    fn bearer(&self) -> Bearer {
        self.original
            .as_ref()
            .map(|original| original.bearer())
            .unwrap_or_default()
    }

    pub fn is_packet_voice(&self) -> bool {
        self.bearer() == Bearer::PacketVoice
    }

    /// Whether the dialed address is a local emergency number
    pub fn is_emergency(&self) -> bool {
        match &self.original {
            Some(original) if original.phone().is_some() => self
                .context
                .emergency_numbers
                .is_local_emergency_number(&original.address()),
            _ => false,
        }
    }

    fn dtmf_mode(&self) -> DtmfMode {
        DtmfMode::select(self.bearer(), self.context.settings.dtmf_tone_type())
    }

    fn notify(&self, event: CallControlEvent) {
        // Listener may already be gone.
        let _ = self.listener_tx.send(event);
    }

    /// Play a DTMF digit, as a burst or as a continuous tone.
    pub fn play_tone(&self, digit: char) -> Result<()> {
        if self.closed {
            debug!("Connection {} closed, ignoring tone request", self.id);
            return Ok(());
        }
        let digit = validate_digit(digit)?;
        let Some(phone) = self.phone() else {
            warn!("Connection {} has no phone, tone request dropped", self.id);
            return Ok(());
        };

        let outcome = self
            .tones
            .play(digit, self.dtmf_mode(), phone.as_ref(), &self.dispatcher);
        if outcome == ToneOutcome::Queued {
            debug!("Connection {} has {} queued tone[s]", self.id, self.tones.pending_digits());
        }
        Ok(())
    }

    pub fn stop_tone(&self) {
        if self.closed {
            return;
        }
        if let Some(phone) = self.phone() {
            self.tones.stop(self.dtmf_mode(), phone.as_ref());
        }
    }

    /// Reject a ringing or waiting call.
    pub fn reject(&mut self) {
        if self.closed || self.state.is_terminal() {
            return;
        }
        let Some(original) = self.original.clone() else {
            warn!("Rejecting connection {} without an underlying call leg", self.id);
            self.set_disconnected(DisconnectCause::Local);
            return;
        };

        match original.state() {
            // Normal ringing calls are handled the generic way.
            CallState::Incoming => self.reject_ringing(original.as_ref()),
            CallState::Waiting => self.hangup_call_waiting(DisconnectCause::IncomingRejected),
            other => {
                error!(
                    "Rejecting a non-ringing call: connection {} is {}",
                    self.id, other
                );
                self.hangup_and_disconnect(original.as_ref(), DisconnectCause::Local);
            }
        }
    }

    fn reject_ringing(&mut self, original: &dyn NetworkConnection) {
        match original.hangup() {
            Ok(()) => info!("Rejected ringing connection {}", self.id),
            Err(e) => {
                warn!("Failed to reject ringing connection {}: {}", self.id, e);
                self.set_disconnected(DisconnectCause::IncomingRejected);
            }
        }
    }

    fn hangup_call_waiting(&mut self, cause: DisconnectCause) {
        self.call_waiting.disarm();
        if let Some(original) = self.original.clone() {
            self.hangup_and_disconnect(original.as_ref(), cause);
        }
    }

    fn hangup_and_disconnect(&mut self, original: &dyn NetworkConnection, cause: DisconnectCause) {
        if let Err(e) = original.hangup() {
            error!("Failed to hang up connection {}: {}", self.id, e);
        }
        self.set_disconnected(cause);
    }

    /// Answer the call, cancelling any pending missed-call deadline first.
    pub fn answer(&mut self) {
        if self.closed || self.state.is_terminal() {
            return;
        }
        if self.call_waiting.disarm() {
            debug!("Call waiting timer cancelled for connection {}", self.id);
        }
        match self.phone() {
            Some(phone) => {
                if let Err(e) = phone.accept_call() {
                    error!("Failed to answer connection {}: {}", self.id, e);
                }
            }
            None => warn!("Connection {} has no phone to answer on", self.id),
        }
    }

    /// Lifecycle state change callback.
    /// Disconnected is terminal: later transitions are ignored.
    pub fn on_state_changed(&mut self, state: ConnectionState) {
        if self.closed {
            return;
        }
        if self.state.is_terminal() {
            debug!(
                "Connection {} already {}, ignoring transition to {}",
                self.id, self.state, state
            );
            return;
        }
        self.is_call_waiting =
            !state.is_terminal() && self.original_state() == Some(CallState::Waiting);

        if let Some(player) = &self.context.emergency_tone_player {
            if state == ConnectionState::Dialing {
                if self.is_emergency() {
                    player.start();
                }
            } else {
                // No-op when it was never started.
                player.stop();
            }
        }

        info!("Connection {} state {} -> {}", self.id, self.state, state);
        self.state = state;
        self.notify(CallControlEvent::StateChanged {
            connection_id: self.id,
            state,
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.on_state_changed(state);
        }
    }

    fn set_disconnected(&mut self, cause: DisconnectCause) {
        if self.state.is_terminal() {
            return;
        }
        self.call_waiting.disarm();
        self.disconnect_cause = Some(cause);
        self.set_state(ConnectionState::Disconnected);
        info!("Connection {} disconnected: {}", self.id, cause);
        self.notify(CallControlEvent::Disconnected {
            connection_id: self.id,
            cause,
        });
    }

    /// Pull the state of the underlying call leg into the lifecycle state.
    pub fn update_state(&mut self) {
        if self.closed || self.state.is_terminal() {
            return;
        }
        let Some(state) = self.original_state() else {
            return;
        };
        self.is_call_waiting = state == CallState::Waiting;

        match state {
            CallState::Idle | CallState::Disconnecting => {}
            CallState::Active => self.set_state(ConnectionState::Active),
            CallState::Holding => self.set_state(ConnectionState::Holding),
            CallState::Dialing | CallState::Alerting => self.set_state(ConnectionState::Dialing),
            CallState::Incoming | CallState::Waiting => self.set_state(ConnectionState::Ringing),
            CallState::Disconnected => self.set_disconnected(DisconnectCause::Normal),
        }
    }

    /// Bind to a (possibly replaced) underlying call leg.
    pub fn set_original_connection(&mut self, original: Arc<dyn NetworkConnection>) {
        if self.closed {
            warn!("Connection {} closed, ignoring rebind", self.id);
            return;
        }
        if let Some(phone) = self.phone() {
            phone.unregister_for_line_control_info(self.id);
        }

        self.original = Some(original);
        match self.phone() {
            Some(phone) => {
                phone.register_for_line_control_info(self.dispatcher.line_status_subscriber());
                debug!(
                    "Connection {} registered for line control info on phone {}",
                    self.id,
                    phone.phone_id()
                );
            }
            None => warn!(
                "Connection {} bound to a call leg without a phone; line control info unavailable",
                self.id
            ),
        }
        self.update_state();
    }

    /// Process one dispatched protocol event.
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        if self.closed {
            debug!("Connection {} closed, dropping {:?}", self.id, event);
            return;
        }
        match event {
            ConnectionEvent::CallWaitingMissed { generation } => {
                if self.call_waiting.expire(generation) {
                    info!("Call waiting connection {} was not answered in time", self.id);
                    self.hangup_call_waiting(DisconnectCause::IncomingMissed);
                } else {
                    debug!("Stale call waiting deadline ignored for connection {}", self.id);
                }
            }
            ConnectionEvent::BurstDtmfConfirmed => {
                let phone = self.phone();
                self.tones.on_confirmation(phone.as_deref(), &self.dispatcher);
            }
            ConnectionEvent::LineControlInfo => {
                if let Some(original) = &self.original {
                    self.line_status.on_line_status_event(original.as_ref());
                }
            }
        }
    }

    /// Tear the connection down. Queued tones are dropped without report.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("Closing connection {}", self.id);

        if let Some(phone) = self.phone() {
            phone.unregister_for_line_control_info(self.id);
        }
        if let Some(player) = &self.context.emergency_tone_player {
            player.stop();
        }
        self.call_waiting.disarm();
        self.tones.discard();
        self.line_status.reset();
        self.dispatcher.shutdown();
        self.original = None;
        self.closed = true;

        self.notify(CallControlEvent::Closed {
            connection_id: self.id,
        });
    }

    /// New controller on the same call leg and collaborators, with fresh
    /// protocol state. Listeners are not copied.
    pub fn clone_connection(&self) -> CdmaConnection {
        Self::build(self.original.clone(), self.context.clone(), self.options)
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::SUPPORT_HOLD;
        if self.is_packet_voice() {
            capabilities |= Capabilities::MERGE_CONFERENCE;
        }
        if self.options.allow_mute {
            capabilities |= Capabilities::MUTE;
        }
        capabilities
    }

    /// Merge with `other`. Only packet voice legs can conference.
    pub fn perform_conference(&mut self, other: &CdmaConnection) -> bool {
        if self.closed {
            return false;
        }
        if !self.is_packet_voice() {
            warn!(
                "Non-packet-voice CDMA connection {} attempted to conference with {}",
                self.id,
                other.id()
            );
            return false;
        }

        match self.phone() {
            Some(phone) => match phone.conference() {
                Ok(()) => true,
                Err(e) => {
                    error!("Conference of {} with {} failed: {}", self.id, other.id(), e);
                    false
                }
            },
            None => false,
        }
    }

    pub fn force_as_dialing(&mut self, is_dialing: bool) {
        if is_dialing {
            self.set_state(ConnectionState::Dialing);
        } else {
            self.update_state();
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            state: self.state,
            direction: self.options.direction,
            bearer: self.bearer(),
            is_call_waiting: self.is_call_waiting,
            queued_tones: self.tones.pending_digits(),
            tone_confirmation_pending: self.tones.is_confirmation_pending(),
            call_waiting_timer_armed: self.call_waiting.is_armed(),
            connection_time_reset: self.line_status.has_reset(),
            disconnect_cause: self.disconnect_cause,
            capabilities: self.capabilities().bits(),
            closed: self.closed,
            created_at: self.created_at,
        }
    }
}

/// Drive `connection` from its event channel until it is closed.
pub async fn run_event_loop(
    connection: Arc<Mutex<CdmaConnection>>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let (id, shutdown) = {
        let connection = connection.lock().await;
        (connection.id(), connection.dispatcher().shutdown_token())
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => connection.lock().await.handle_event(event),
                None => break,
            },
        }
    }
    debug!("Event loop for connection {} finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{SimulatedConnection, SimulatedPhone, SimulatedTonePlayer};
    use crate::protocols::dtmf::DtmfToneType;
    use crate::services::emergency::EmergencyNumbers;
    use crate::services::settings::SystemSettings;
    use crate::Error;

    struct Harness {
        phone: Arc<SimulatedPhone>,
        settings: Arc<SystemSettings>,
        player: Arc<SimulatedTonePlayer>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                phone: Arc::new(SimulatedPhone::new(0)),
                settings: Arc::new(SystemSettings::default()),
                player: Arc::new(SimulatedTonePlayer::default()),
            }
        }

        fn context(&self) -> ConnectionContext {
            ConnectionContext {
                settings: self.settings.clone(),
                emergency_numbers: Arc::new(EmergencyNumbers::new(["911", "112"])),
                emergency_tone_player: Some(self.player.clone()),
            }
        }

        fn leg(&self, leg: SimulatedConnection) -> Arc<SimulatedConnection> {
            Arc::new(leg)
        }

        fn outgoing(&self, address: &str) -> Arc<SimulatedConnection> {
            self.leg(SimulatedConnection::outgoing(address, Some(self.phone.clone())))
        }

        fn incoming(&self) -> Arc<SimulatedConnection> {
            self.leg(SimulatedConnection::incoming("5550100", Some(self.phone.clone())))
        }

        fn waiting(&self) -> Arc<SimulatedConnection> {
            self.leg(SimulatedConnection::waiting("5550100", Some(self.phone.clone())))
        }

        fn connect(
            &self,
            leg: &Arc<SimulatedConnection>,
            direction: CallDirection,
        ) -> CdmaConnection {
            let options = ConnectionOptions {
                direction,
                allow_mute: true,
                ..ConnectionOptions::default()
            };
            let leg: Arc<dyn NetworkConnection> = leg.clone();
            CdmaConnection::new(Some(leg), self.context(), options).unwrap()
        }
    }

    fn drain(connection: &mut CdmaConnection, rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Ok(event) = rx.try_recv() {
            connection.handle_event(event);
        }
    }

    #[tokio::test]
    async fn test_burst_tones_queue_until_confirmed() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        leg.set_state(CallState::Active);
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);
        let mut events = connection.take_event_receiver().unwrap();

        for digit in "1234".chars() {
            connection.play_tone(digit).unwrap();
            connection.stop_tone();
        }
        assert_eq!(harness.phone.burst_sends(), vec!["1".to_string()]);
        assert_eq!(harness.phone.stop_count(), 0);
        assert_eq!(connection.snapshot().queued_tones, 3);

        assert!(harness.phone.confirm_next_burst());
        drain(&mut connection, &mut events);
        assert_eq!(
            harness.phone.burst_sends(),
            vec!["1".to_string(), "234".to_string()]
        );

        connection.play_tone('5').unwrap();
        assert!(harness.phone.confirm_next_burst());
        drain(&mut connection, &mut events);
        assert_eq!(harness.phone.burst_sends().last().unwrap(), "5");

        assert!(harness.phone.confirm_next_burst());
        drain(&mut connection, &mut events);
        let snapshot = connection.snapshot();
        assert_eq!(snapshot.queued_tones, 0);
        assert!(!snapshot.tone_confirmation_pending);
    }

    #[tokio::test]
    async fn test_continuous_tones_when_long_selected() {
        let harness = Harness::new();
        harness.settings.set_dtmf_tone_type(Some(DtmfToneType::Long));
        let leg = harness.outgoing("5551234");
        let connection = harness.connect(&leg, CallDirection::Outgoing);

        connection.play_tone('9').unwrap();
        connection.stop_tone();

        assert_eq!(harness.phone.started_tones(), vec!['9']);
        assert_eq!(harness.phone.stop_count(), 1);
        assert!(harness.phone.burst_sends().is_empty());
    }

    #[tokio::test]
    async fn test_packet_voice_forces_continuous_tones() {
        let harness = Harness::new();
        let leg = harness.leg(
            SimulatedConnection::outgoing("5551234", Some(harness.phone.clone()))
                .with_bearer(Bearer::PacketVoice),
        );
        let connection = harness.connect(&leg, CallDirection::Outgoing);

        connection.play_tone('3').unwrap();

        assert_eq!(harness.phone.started_tones(), vec!['3']);
        assert!(harness.phone.burst_sends().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_digit_rejected_without_network_io() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        let connection = harness.connect(&leg, CallDirection::Outgoing);

        assert!(matches!(connection.play_tone('z'), Err(Error::InvalidDigit)));
        assert!(harness.phone.burst_sends().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_waiting_call_is_missed() {
        let harness = Harness::new();
        let leg = harness.waiting();
        let mut connection = harness.connect(&leg, CallDirection::Incoming);
        let mut events = connection.take_event_receiver().unwrap();
        let mut listener = connection.take_listener_receiver().unwrap();

        assert!(connection.is_call_waiting());
        assert_eq!(connection.state(), ConnectionState::Ringing);
        assert!(connection.snapshot().call_waiting_timer_armed);

        let early = tokio::time::timeout(Duration::from_secs(19), events.recv()).await;
        assert!(early.is_err());

        let event = events.recv().await.unwrap();
        connection.handle_event(event);

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::IncomingMissed));
        assert_eq!(leg.hangups(), 1);
        assert!(!connection.snapshot().call_waiting_timer_armed);

        let mut saw_missed = false;
        while let Ok(event) = listener.try_recv() {
            if let CallControlEvent::Disconnected { cause, .. } = event {
                assert_eq!(cause, DisconnectCause::IncomingMissed);
                saw_missed = true;
            }
        }
        assert!(saw_missed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_waiting_call_cancels_timer() {
        let harness = Harness::new();
        let leg = harness.waiting();
        let mut connection = harness.connect(&leg, CallDirection::Incoming);
        let mut events = connection.take_event_receiver().unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        connection.answer();

        assert_eq!(harness.phone.accept_count(), 1);
        assert!(!connection.snapshot().call_waiting_timer_armed);

        let result = tokio::time::timeout(Duration::from_secs(60), events.recv()).await;
        assert!(result.is_err());
        assert_ne!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(leg.hangups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_call_tolerates_hangup_failure() {
        let harness = Harness::new();
        let leg = harness.waiting();
        leg.set_fail_hangup(true);
        let mut connection = harness.connect(&leg, CallDirection::Incoming);
        let mut events = connection.take_event_receiver().unwrap();

        let event = events.recv().await.unwrap();
        connection.handle_event(event);

        assert_eq!(leg.hangups(), 1);
        assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::IncomingMissed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_voice_waiting_call_not_timed() {
        let harness = Harness::new();
        let leg = harness.leg(
            SimulatedConnection::waiting("5550100", Some(harness.phone.clone()))
                .with_bearer(Bearer::PacketVoice),
        );
        let mut connection = harness.connect(&leg, CallDirection::Incoming);
        let mut events = connection.take_event_receiver().unwrap();

        assert!(connection.is_call_waiting());
        assert!(!connection.snapshot().call_waiting_timer_armed);
        let result = tokio::time::timeout(Duration::from_secs(60), events.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reject_waiting_call() {
        let harness = Harness::new();
        let leg = harness.waiting();
        let mut connection = harness.connect(&leg, CallDirection::Incoming);

        connection.reject();

        assert_eq!(leg.hangups(), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::IncomingRejected));
        assert!(!connection.snapshot().call_waiting_timer_armed);
    }

    #[tokio::test]
    async fn test_reject_ringing_call_uses_generic_path() {
        let harness = Harness::new();
        let leg = harness.incoming();
        let mut connection = harness.connect(&leg, CallDirection::Incoming);

        connection.reject();
        assert_eq!(leg.hangups(), 1);
        // Terminal state follows the network report.
        assert_eq!(connection.state(), ConnectionState::Ringing);
        connection.update_state();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::Normal));
    }

    #[tokio::test]
    async fn test_reject_ringing_call_hangup_failure_disconnects() {
        let harness = Harness::new();
        let leg = harness.incoming();
        leg.set_fail_hangup(true);
        let mut connection = harness.connect(&leg, CallDirection::Incoming);

        connection.reject();

        assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::IncomingRejected));
    }

    #[tokio::test]
    async fn test_reject_non_ringing_call_still_disconnects() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        leg.set_state(CallState::Active);
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);
        assert_eq!(connection.state(), ConnectionState::Active);

        connection.reject();

        assert_eq!(leg.hangups(), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::Local));
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_control_info_resets_duration_once() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        leg.set_state(CallState::Active);
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);
        let mut events = connection.take_event_receiver().unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        for _ in 0..3 {
            assert_eq!(harness.phone.broadcast_line_control_info(), 1);
            drain(&mut connection, &mut events);
        }

        assert_eq!(leg.time_resets(), 1);
        assert!(connection.snapshot().connection_time_reset);
    }

    #[tokio::test]
    async fn test_emergency_tone_follows_dialing() {
        let harness = Harness::new();
        let leg = harness.outgoing("tel:911");
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);

        assert_eq!(connection.state(), ConnectionState::Dialing);
        assert!(harness.player.is_playing());

        leg.set_state(CallState::Active);
        connection.update_state();
        assert!(!harness.player.is_playing());
        assert_eq!(harness.player.starts(), 1);
    }

    #[tokio::test]
    async fn test_non_emergency_dial_never_starts_tone() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);

        assert_eq!(connection.state(), ConnectionState::Dialing);
        leg.set_state(CallState::Active);
        connection.update_state();

        assert_eq!(harness.player.starts(), 0);
        assert!(harness.player.stops() >= 1);
        assert!(!harness.player.is_playing());
    }

    #[tokio::test]
    async fn test_force_as_dialing() {
        let harness = Harness::new();
        let leg = harness.outgoing("112");
        leg.set_state(CallState::Active);
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);
        assert!(!harness.player.is_playing());

        connection.force_as_dialing(true);
        assert_eq!(connection.state(), ConnectionState::Dialing);
        assert!(harness.player.is_playing());

        connection.force_as_dialing(false);
        assert_eq!(connection.state(), ConnectionState::Active);
        assert!(!harness.player.is_playing());
    }

    #[tokio::test]
    async fn test_rebind_resubscribes_line_control() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);
        assert!(harness.phone.is_line_control_registered(connection.id()));

        let other_phone = Arc::new(SimulatedPhone::new(1));
        let replacement = Arc::new(SimulatedConnection::outgoing(
            "5551234",
            Some(other_phone.clone()),
        ));
        replacement.set_state(CallState::Active);
        connection.set_original_connection(replacement);

        assert!(!harness.phone.is_line_control_registered(connection.id()));
        assert!(other_phone.is_line_control_registered(connection.id()));
        assert_eq!(connection.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_close_discards_state_and_ignores_late_events() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        leg.set_state(CallState::Active);
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);
        let mut events = connection.take_event_receiver().unwrap();

        connection.play_tone('1').unwrap();
        connection.play_tone('2').unwrap();
        connection.close();

        assert!(connection.is_closed());
        assert_eq!(harness.phone.line_control_subscribers(), 0);
        let snapshot = connection.snapshot();
        assert_eq!(snapshot.queued_tones, 0);
        assert!(!snapshot.connection_time_reset);

        // Confirmation arriving after close is dropped.
        assert!(harness.phone.confirm_next_burst());
        assert!(events.try_recv().is_err());
        connection.handle_event(ConnectionEvent::BurstDtmfConfirmed);
        assert_eq!(harness.phone.burst_sends().len(), 1);

        connection.play_tone('3').unwrap();
        assert_eq!(harness.phone.burst_sends().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_starts_with_fresh_protocol_state() {
        let harness = Harness::new();
        let leg = harness.waiting();
        let mut connection = harness.connect(&leg, CallDirection::Incoming);
        let mut events = connection.take_event_receiver().unwrap();

        // Handover to an outgoing leg keeps the armed timer.
        let handover = harness.outgoing("5550100");
        handover.set_state(CallState::Active);
        connection.set_original_connection(handover.clone());
        tokio::time::advance(Duration::from_secs(2)).await;

        connection.play_tone('1').unwrap();
        connection.play_tone('2').unwrap();
        assert_eq!(harness.phone.broadcast_line_control_info(), 1);
        drain(&mut connection, &mut events);

        let original = connection.snapshot();
        assert!(original.tone_confirmation_pending);
        assert_eq!(original.queued_tones, 1);
        assert!(original.call_waiting_timer_armed);
        assert!(original.connection_time_reset);
        assert_eq!(handover.time_resets(), 1);

        let clone = connection.clone_connection();
        let snapshot = clone.snapshot();
        assert_ne!(snapshot.id, original.id);
        assert_eq!(snapshot.queued_tones, 0);
        assert!(!snapshot.tone_confirmation_pending);
        assert!(!snapshot.call_waiting_timer_armed);
        assert!(!snapshot.connection_time_reset);
        assert_eq!(snapshot.direction, CallDirection::Incoming);
        assert_eq!(clone.capabilities(), connection.capabilities());
        assert!(harness.phone.is_line_control_registered(clone.id()));
    }

    #[tokio::test]
    async fn test_disconnected_is_terminal() {
        let harness = Harness::new();
        let leg = harness.waiting();
        leg.set_fail_hangup(true);
        let mut connection = harness.connect(&leg, CallDirection::Incoming);
        let mut listener = connection.take_listener_receiver().unwrap();

        connection.reject();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.is_call_waiting());
        while listener.try_recv().is_ok() {}

        // The leg still reports waiting after the failed hangup.
        connection.update_state();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        connection.force_as_dialing(true);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        connection.on_state_changed(ConnectionState::Active);
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.answer();
        assert_eq!(harness.phone.accept_count(), 0);
        connection.reject();
        assert_eq!(leg.hangups(), 1);

        assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::IncomingRejected));
        assert!(!harness.player.is_playing());
        assert!(listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emergency_tone_not_restarted_after_disconnect() {
        let harness = Harness::new();
        let leg = harness.outgoing("911");
        let mut connection = harness.connect(&leg, CallDirection::Outgoing);
        assert!(harness.player.is_playing());

        leg.set_state(CallState::Disconnected);
        connection.update_state();
        assert!(!harness.player.is_playing());

        connection.force_as_dialing(true);
        assert!(!harness.player.is_playing());
        assert_eq!(harness.player.starts(), 1);
    }

    #[tokio::test]
    async fn test_capabilities() {
        let harness = Harness::new();
        let leg = harness.outgoing("5551234");
        let connection = harness.connect(&leg, CallDirection::Outgoing);
        let caps = connection.capabilities();
        assert!(caps.contains(Capabilities::SUPPORT_HOLD | Capabilities::MUTE));
        assert!(!caps.contains(Capabilities::MERGE_CONFERENCE));

        let muted = CdmaConnection::new(
            Some(leg.clone() as Arc<dyn NetworkConnection>),
            harness.context(),
            ConnectionOptions::default(),
        )
        .unwrap();
        assert!(!muted.capabilities().contains(Capabilities::MUTE));
    }

    #[tokio::test]
    async fn test_conference_requires_packet_voice() {
        let harness = Harness::new();
        let circuit = harness.outgoing("5551234");
        let packet = harness.leg(
            SimulatedConnection::outgoing("5554321", Some(harness.phone.clone()))
                .with_bearer(Bearer::PacketVoice),
        );
        let mut circuit_connection = harness.connect(&circuit, CallDirection::Outgoing);
        let mut packet_connection = harness.connect(&packet, CallDirection::Outgoing);

        assert!(!circuit_connection.perform_conference(&packet_connection));
        assert_eq!(harness.phone.conference_count(), 0);

        assert!(packet_connection.perform_conference(&circuit_connection));
        assert_eq!(harness.phone.conference_count(), 1);
        assert!(packet_connection
            .capabilities()
            .contains(Capabilities::MERGE_CONFERENCE));
    }

    #[test]
    fn test_waiting_call_without_runtime_is_an_error() {
        let harness = Harness::new();
        let waiting: Arc<dyn NetworkConnection> = harness.waiting();
        let result = CdmaConnection::new(
            Some(waiting),
            harness.context(),
            ConnectionOptions::default(),
        );
        assert!(matches!(result, Err(Error::InvalidState(_))));

        let outgoing: Arc<dyn NetworkConnection> = harness.outgoing("5551234");
        let connection =
            CdmaConnection::new(Some(outgoing), harness.context(), ConnectionOptions::default())
                .unwrap();
        assert_eq!(connection.state(), ConnectionState::Dialing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_drives_connection() {
        let harness = Harness::new();
        let leg = harness.waiting();
        let mut connection = harness.connect(&leg, CallDirection::Incoming);
        let events = connection.take_event_receiver().unwrap();
        let connection = Arc::new(Mutex::new(connection));

        let task = tokio::spawn(run_event_loop(Arc::clone(&connection), events));
        tokio::time::sleep(Duration::from_secs(21)).await;

        {
            let mut connection = connection.lock().await;
            assert_eq!(connection.disconnect_cause(), Some(DisconnectCause::IncomingMissed));
            connection.close();
        }
        tokio_test::assert_ok!(task.await);
    }
}
