//! CSP Channel Communication Protocol Types
//!
//! All traffic into and out of the orchestrator flows through these types:
//! `Command` from the UI, `Event` from substrates and background tasks, and
//! `AppEvent` back to the UI.

use crate::config::ServiceDescriptor;
use crate::errors::{AttachError, StartError};
use crate::state::OrchestratorState;
use crate::types::{
    DiscoveryAddress, DiscoveryHandleId, LinkRequestId, LinkState, MessageId, Peer, PeerHandle,
    Role, SessionId, StreamId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

// ----------------------------------------------------------------------------
// Command: UI → Orchestrator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Attach to the discovery substrate
    Attach,
    /// Start the advertise or discover role
    Start { descriptor: ServiceDescriptor },
    /// Ask for a link to the tracked peer (discoverer only)
    RequestLink,
    /// Write one line to the stream connection
    Send { line: String },
    /// Try the outbound connect again after the retry budget ran out
    RetryConnect,
    /// Tear everything down and return to idle
    Close,
    GetStatus,
    Shutdown,
}

// ----------------------------------------------------------------------------
// Event: Substrates and Tasks → Orchestrator
// ----------------------------------------------------------------------------

/// Every event names the substrate object it belongs to. The orchestrator
/// drops events whose id is no longer current.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // ---- Radio session ----
    Attached {
        session: SessionId,
    },
    AttachFailed {
        session: SessionId,
        error: AttachError,
    },
    IdentifierChanged {
        session: SessionId,
        address: DiscoveryAddress,
    },

    // ---- Discovery session ----
    PublishStarted {
        session: SessionId,
        handle: DiscoveryHandleId,
    },
    SubscribeStarted {
        session: SessionId,
        handle: DiscoveryHandleId,
    },
    StartFailed {
        session: SessionId,
        error: StartError,
    },
    MessageReceived {
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        payload: Vec<u8>,
    },
    ServiceDiscovered {
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        service_info: Vec<u8>,
        match_filter: Vec<Vec<u8>>,
    },
    MessageSendSucceeded {
        handle: DiscoveryHandleId,
        message_id: MessageId,
    },
    MessageSendFailed {
        handle: DiscoveryHandleId,
        message_id: MessageId,
    },
    DiscoveryTerminated {
        handle: DiscoveryHandleId,
    },

    // ---- Link ----
    LinkAvailable {
        request: LinkRequestId,
    },
    LinkCapabilitiesChanged {
        request: LinkRequestId,
        peer_address: Option<IpAddr>,
    },
    LinkUnavailable {
        request: LinkRequestId,
    },
    LinkLost {
        request: LinkRequestId,
    },
    LinkTimedOut {
        request: LinkRequestId,
    },

    // ---- Stream ----
    StreamOpened {
        stream: StreamId,
        remote: Option<std::net::SocketAddr>,
    },
    StreamFailed {
        stream: StreamId,
        error: String,
    },
    LineReceived {
        stream: StreamId,
        line: String,
    },
    ChannelClosed {
        stream: StreamId,
        reason: Option<String>,
    },
    SendCompleted {
        stream: StreamId,
        line: String,
        result: Result<(), String>,
    },

    // ---- Timers ----
    RetryConnect {
        request: LinkRequestId,
        attempt: u32,
    },
}

impl Event {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Event::Attached { .. } => "Attached",
            Event::AttachFailed { .. } => "AttachFailed",
            Event::IdentifierChanged { .. } => "IdentifierChanged",
            Event::PublishStarted { .. } => "PublishStarted",
            Event::SubscribeStarted { .. } => "SubscribeStarted",
            Event::StartFailed { .. } => "StartFailed",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::ServiceDiscovered { .. } => "ServiceDiscovered",
            Event::MessageSendSucceeded { .. } => "MessageSendSucceeded",
            Event::MessageSendFailed { .. } => "MessageSendFailed",
            Event::DiscoveryTerminated { .. } => "DiscoveryTerminated",
            Event::LinkAvailable { .. } => "LinkAvailable",
            Event::LinkCapabilitiesChanged { .. } => "LinkCapabilitiesChanged",
            Event::LinkUnavailable { .. } => "LinkUnavailable",
            Event::LinkLost { .. } => "LinkLost",
            Event::LinkTimedOut { .. } => "LinkTimedOut",
            Event::StreamOpened { .. } => "StreamOpened",
            Event::StreamFailed { .. } => "StreamFailed",
            Event::LineReceived { .. } => "LineReceived",
            Event::ChannelClosed { .. } => "ChannelClosed",
            Event::SendCompleted { .. } => "SendCompleted",
            Event::RetryConnect { .. } => "RetryConnect",
        }
    }
}

// ----------------------------------------------------------------------------
// AppEvent: Orchestrator → UI
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    IdentifierReady {
        address: DiscoveryAddress,
    },
    PeerDiscovered {
        peer: Peer,
    },
    /// First discovery-layer message on the advertiser side
    HandshakeReceived {
        peer: Peer,
        message: String,
    },
    /// Delivery report for a discovery-layer message; informational only
    HandshakeStatus {
        message_id: MessageId,
        delivered: bool,
    },
    LinkEstablished {
        peer_address: IpAddr,
    },
    LineReceived {
        line: String,
    },
    LineSent {
        line: String,
    },
    SendFailed {
        line: String,
        reason: String,
    },
    Notification {
        severity: Severity,
        message: String,
    },
    /// One step of ordered teardown completed
    ResourceReleased {
        resource: ReleasedResource,
    },
    StatusReport(StatusReport),
}

impl AppEvent {
    /// Chat transcript line for received and sent lines
    pub fn transcript(&self) -> Option<String> {
        match self {
            AppEvent::LineReceived { line } => Some(format!("Peer: {}", line)),
            AppEvent::LineSent { line } => Some(format!("You: {}", line)),
            _ => None,
        }
    }

    pub fn notification<T: Into<String>>(severity: Severity, message: T) -> Self {
        AppEvent::Notification {
            severity,
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// How prominently the UI should show a transient notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Resources released during teardown, reported in release order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleasedResource {
    Stream(StreamId),
    DiscoverySession(DiscoveryHandleId),
    Link(LinkRequestId),
    RadioSession(SessionId),
}

impl fmt::Display for ReleasedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleasedResource::Stream(id) => write!(f, "{}", id),
            ReleasedResource::DiscoverySession(id) => write!(f, "{}", id),
            ReleasedResource::Link(id) => write!(f, "{}", id),
            ReleasedResource::RadioSession(id) => write!(f, "{}", id),
        }
    }
}

/// Snapshot answered to `Command::GetStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub role: Role,
    pub state: OrchestratorState,
    pub identifier: Option<DiscoveryAddress>,
    pub peer: Option<Peer>,
    pub link: Option<LinkState>,
    pub stream_open: bool,
    pub lines_sent: u64,
    pub lines_received: u64,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.role, self.state)?;
        if let Some(peer) = &self.peer {
            write!(f, ", peer {}", peer)?;
        }
        if let Some(link) = &self.link {
            write!(f, ", link {}", link)?;
        }
        write!(
            f,
            ", stream {}, {} sent / {} received",
            if self.stream_open { "open" } else { "closed" },
            self.lines_sent,
            self.lines_received
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
