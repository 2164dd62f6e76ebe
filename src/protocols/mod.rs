//! Signalling protocols for the CDMA connection controller

pub mod dtmf;

pub use dtmf::{DtmfMode, DtmfToneType, ToneOutcome, ToneTransmitter};
