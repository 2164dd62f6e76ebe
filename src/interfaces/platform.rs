//! Platform collaborators: audio cues, settings and number classification

use crate::protocols::dtmf::DtmfToneType;

/// Plays the audible cue for emergency calls while they dial
pub trait EmergencyTonePlayer: Send + Sync {
    /// Start the cue. Repeated starts are harmless.
    fn start(&self);

    /// Stop the cue. Harmless when it was never started.
    fn stop(&self);
}

pub trait SettingsProvider: Send + Sync {
    /// DTMF tone type selected by the user, `None` when never set
    fn dtmf_tone_type(&self) -> Option<DtmfToneType>;
}

pub trait EmergencyNumberClassifier: Send + Sync {
    fn is_local_emergency_number(&self, address: &str) -> bool;
}
