//! nanlink Core
//!
//! Stable types shared by the runtime, the in-memory substrate and the CLI:
//! identifiers, the error taxonomy, configuration, the channel message
//! schema, substrate capability traits and the orchestrator state machine.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod errors;
pub mod state;
pub mod substrate;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{
    create_app_event_channel, create_command_channel, create_event_channel, AppEvent,
    AppEventReceiver, AppEventSender, ChannelError, Command, CommandReceiver, CommandSender,
    Event, EventReceiver, EventSender, NonBlockingSend, ReleasedResource, Severity, StatusReport,
};
pub use config::{
    ChannelConfig, HandshakeConfig, LinkConfig, NanConfig, PublishType, ServiceDescriptor,
    StreamConfig, SubscribeType,
};
pub use errors::{AttachError, LinkError, NanError, NanResult, StartError, StreamError};
pub use state::{AuditEntry, OrchestratorState, StateEvent, StateTransition, StateTransitionError};
pub use substrate::{LinkSubstrate, RadioSubstrate};
pub use types::{
    DiscoveryAddress, DiscoveryHandleId, LinkRequestId, LinkState, MessageId, Peer, PeerHandle,
    Role, SessionId, StreamId, Timestamp,
};
