//! Collaborator interfaces of the connection controller

pub mod network;
pub mod platform;
pub mod simulated;

pub use network::{Bearer, CallState, NetworkConnection, RadioPhone};
pub use platform::{EmergencyNumberClassifier, EmergencyTonePlayer, SettingsProvider};
pub use simulated::{NetworkAction, SimulatedConnection, SimulatedPhone, SimulatedTonePlayer};
