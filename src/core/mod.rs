//! Connection controller core

pub mod connection;
pub mod dispatcher;
pub mod state;

pub use connection::{
    run_event_loop, CdmaConnection, ConnectionContext, ConnectionOptions, ConnectionSnapshot,
};
pub use dispatcher::{
    BurstConfirmation, ConnectionEvent, EventDispatcher, LineStatusSubscriber, TimerHandle,
};
pub use state::{
    CallControlEvent, CallDirection, Capabilities, ConnectionId, ConnectionState, DisconnectCause,
};
