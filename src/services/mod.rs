//! Timing and platform services used by the connection controller

pub mod call_waiting;
pub mod emergency;
pub mod line_status;
pub mod settings;

pub use call_waiting::{CallWaitingGuard, CALL_WAITING_TIMEOUT};
pub use emergency::EmergencyNumbers;
pub use line_status::LineStatusDebouncer;
pub use settings::SystemSettings;
