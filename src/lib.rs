//! CDMA Connection - call signaling and timing controller
//!
//! Protocol-level state for a single CDMA call leg: burst DTMF with a single
//! outstanding confirmation, the call waiting timeout, connect time
//! correction on line control records and the emergency dialing tone.

pub mod config;
pub mod core;
pub mod error;
pub mod interfaces;
pub mod protocols;
pub mod services;
pub mod utils;

pub use error::{Error, Result};

/// Controller version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
