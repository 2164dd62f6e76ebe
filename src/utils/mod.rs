//! Utilities for the CDMA connection controller

pub mod logger;

pub use logger::{parse_log_level, setup_logging};
