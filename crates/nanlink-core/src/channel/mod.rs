//! Channel Module
//!
//! CSP channel infrastructure between the UI, the orchestrator and the
//! substrate/stream tasks:
//! - `communication`: commands, events and app events
//! - `utils`: channel aliases and constructors

pub mod communication;
pub mod utils;

pub use communication::{AppEvent, Command, Event, ReleasedResource, Severity, StatusReport};

pub use crate::config::ChannelConfig;

pub use utils::{
    create_app_event_channel, create_command_channel, create_event_channel, AppEventReceiver,
    AppEventSender, ChannelError, CommandReceiver, CommandSender, EventReceiver, EventSender,
    NonBlockingSend,
};
