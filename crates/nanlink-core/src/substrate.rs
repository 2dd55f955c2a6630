//! Substrate Capability Traits
//!
//! The radio discovery and link layers are external collaborators. Each
//! request method takes the orchestrator's `EventSender`; completions and
//! later notifications arrive as `Event`s on that queue rather than through
//! callbacks that touch orchestrator state.

use crate::channel::EventSender;
use crate::config::ServiceDescriptor;
use crate::errors::{AttachError, LinkError, NanResult, StartError};
use crate::types::{DiscoveryHandleId, LinkRequestId, MessageId, PeerHandle, SessionId};

// ----------------------------------------------------------------------------
// Discovery Substrate
// ----------------------------------------------------------------------------

/// Radio discovery substrate: attach, advertise/discover, discovery messages
///
/// Implementations report:
/// - `Event::Attached` / `Event::AttachFailed` once per accepted attach, then
///   at most one `Event::IdentifierChanged`
/// - `Event::PublishStarted` / `Event::SubscribeStarted` / `Event::StartFailed`
///   once per accepted start
/// - any number of `Event::MessageReceived` / `Event::ServiceDiscovered`
/// - `Event::MessageSendSucceeded` / `Event::MessageSendFailed` per send
/// - `Event::DiscoveryTerminated` when the substrate ends a discovery session
#[async_trait::async_trait]
pub trait RadioSubstrate: Send + Sync {
    /// Begin attaching. An `Err` is an up-front refusal; otherwise the
    /// outcome arrives as an event for the returned session.
    async fn attach(&self, sink: EventSender) -> Result<SessionId, AttachError>;

    /// Release an attached session. Unknown sessions are ignored.
    async fn detach(&self, session: SessionId);

    /// Start advertising `descriptor` on `session`
    async fn publish(
        &self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError>;

    /// Start scanning for `descriptor` on `session`
    async fn subscribe(
        &self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError>;

    /// Send a short discovery-layer message to a peer of `handle`
    async fn send_message(
        &self,
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        message_id: MessageId,
        payload: Vec<u8>,
    ) -> NanResult<()>;

    /// Close a discovery session. Unknown or terminated handles are ignored.
    async fn close_discovery(&self, handle: DiscoveryHandleId);
}

// ----------------------------------------------------------------------------
// Link Substrate
// ----------------------------------------------------------------------------

/// Network link substrate for ephemeral point-to-point links
///
/// After an accepted request the substrate reports, in order,
/// `Event::LinkAvailable`, zero or more `Event::LinkCapabilitiesChanged`, and
/// eventually `Event::LinkLost`; or `Event::LinkUnavailable` instead of
/// `Event::LinkAvailable`.
#[async_trait::async_trait]
pub trait LinkSubstrate: Send + Sync {
    async fn request_link(
        &self,
        request: LinkRequestId,
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        sink: EventSender,
    ) -> Result<(), LinkError>;

    /// Drop the link and stop reporting events for `request`
    async fn release_link(&self, request: LinkRequestId);
}
