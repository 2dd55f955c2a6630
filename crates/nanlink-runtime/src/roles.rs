//! Advertise and discover roles
//!
//! Each role owns at most one `DiscoverySessionHandle` and the single `Peer`
//! it tracks. The tracked-peer slot is what makes "first handshake wins" and
//! "first discovery wins" hold at this level; the orchestrator state guard
//! enforces the same rule one layer up.

use std::sync::Arc;

use nanlink_core::{
    DiscoveryHandleId, EventSender, MessageId, NanResult, Peer, PeerHandle, RadioSubstrate, Role,
    ServiceDescriptor, SessionId, StartError, Timestamp,
};
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Discovery Session Handle
// ----------------------------------------------------------------------------

/// An advertise or discover session the substrate confirmed as started
#[derive(Debug, Clone, PartialEq, Eq)]
struct DiscoverySessionHandle {
    id: DiscoveryHandleId,
    role: Role,
    started_at: Timestamp,
    terminated: bool,
}

impl DiscoverySessionHandle {
    fn new(id: DiscoveryHandleId, role: Role) -> Self {
        Self {
            id,
            role,
            started_at: Timestamp::now(),
            terminated: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Shared Slot
// ----------------------------------------------------------------------------

/// Handle and tracked peer shared by both roles
struct DiscoverySlot {
    role: Role,
    substrate: Arc<dyn RadioSubstrate>,
    starting: Option<SessionId>,
    handle: Option<DiscoverySessionHandle>,
    peer: Option<Peer>,
}

impl DiscoverySlot {
    fn new(role: Role, substrate: Arc<dyn RadioSubstrate>) -> Self {
        Self {
            role,
            substrate,
            starting: None,
            handle: None,
            peer: None,
        }
    }

    async fn start(
        &mut self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError> {
        descriptor.validate_for(self.role)?;
        if self.starting.is_some() || self.handle.is_some() {
            return Err(StartError::AlreadyStarted);
        }

        match self.role {
            Role::Advertiser => self.substrate.publish(session, descriptor, sink).await?,
            Role::Discoverer => self.substrate.subscribe(session, descriptor, sink).await?,
        }
        debug!(
            "{} start requested for service '{}' on {}",
            self.role, descriptor.service_name, session
        );
        self.starting = Some(session);
        Ok(())
    }

    fn on_started(&mut self, session: SessionId, id: DiscoveryHandleId) -> bool {
        if self.starting != Some(session) {
            return false;
        }
        self.starting = None;
        info!("{} session {} started", self.role, id);
        self.handle = Some(DiscoverySessionHandle::new(id, self.role));
        true
    }

    fn on_start_failed(&mut self, session: SessionId) -> bool {
        if self.starting != Some(session) {
            return false;
        }
        self.starting = None;
        true
    }

    fn is_live(&self, id: DiscoveryHandleId) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.id == id && !h.terminated)
    }

    /// Record `peer` if the slot is empty
    fn track_first(&mut self, id: DiscoveryHandleId, peer: Peer) -> Option<Peer> {
        if !self.is_live(id) {
            return None;
        }
        if let Some(tracked) = &self.peer {
            debug!("Already tracking {}, ignoring {}", tracked, peer.handle);
            return None;
        }
        self.peer = Some(peer.clone());
        Some(peer)
    }

    fn on_terminated(&mut self, id: DiscoveryHandleId) -> bool {
        match self.handle.as_mut() {
            Some(handle) if handle.id == id && !handle.terminated => {
                info!("{} session {} terminated by substrate", handle.role, id);
                handle.terminated = true;
                self.peer = None;
                true
            }
            _ => false,
        }
    }

    async fn close(&mut self) -> Option<DiscoveryHandleId> {
        self.starting = None;
        self.peer = None;
        let handle = self.handle.take()?;
        if !handle.terminated {
            debug!(
                "Closing {} session {} after {:?}",
                handle.role,
                handle.id,
                Timestamp::now().duration_since(handle.started_at)
            );
            self.substrate.close_discovery(handle.id).await;
        }
        Some(handle.id)
    }
}

// ----------------------------------------------------------------------------
// Advertiser
// ----------------------------------------------------------------------------

/// Publish role: announces a service and reacts to the first handshake
pub struct Advertiser {
    slot: DiscoverySlot,
}

impl Advertiser {
    pub fn new(substrate: Arc<dyn RadioSubstrate>) -> Self {
        Self {
            slot: DiscoverySlot::new(Role::Advertiser, substrate),
        }
    }

    pub async fn start(
        &mut self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError> {
        self.slot.start(session, descriptor, sink).await
    }

    pub fn on_started(&mut self, session: SessionId, handle: DiscoveryHandleId) -> bool {
        self.slot.on_started(session, handle)
    }

    pub fn on_start_failed(&mut self, session: SessionId) -> bool {
        self.slot.on_start_failed(session)
    }

    /// A peer message on `handle`. Returns the peer only for the first
    /// message since the slot was last cleared.
    pub fn on_message(&mut self, handle: DiscoveryHandleId, peer: PeerHandle) -> Option<Peer> {
        self.slot.track_first(handle, Peer::new(peer, handle, None))
    }

    /// Forget the handshake peer so a later message can trigger a new attempt
    pub fn clear_peer(&mut self) {
        self.slot.peer = None;
    }

    pub fn on_terminated(&mut self, handle: DiscoveryHandleId) -> bool {
        self.slot.on_terminated(handle)
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.slot.peer.as_ref()
    }

    pub fn is_live(&self, handle: DiscoveryHandleId) -> bool {
        self.slot.is_live(handle)
    }

    pub async fn close(&mut self) -> Option<DiscoveryHandleId> {
        self.slot.close().await
    }
}

// ----------------------------------------------------------------------------
// Discoverer
// ----------------------------------------------------------------------------

/// Subscribe role: scans for a service and greets the first match
pub struct Discoverer {
    slot: DiscoverySlot,
    next_message_id: u32,
}

impl Discoverer {
    pub fn new(substrate: Arc<dyn RadioSubstrate>) -> Self {
        Self {
            slot: DiscoverySlot::new(Role::Discoverer, substrate),
            next_message_id: 0,
        }
    }

    pub async fn start(
        &mut self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError> {
        self.slot.start(session, descriptor, sink).await
    }

    pub fn on_started(&mut self, session: SessionId, handle: DiscoveryHandleId) -> bool {
        self.slot.on_started(session, handle)
    }

    pub fn on_start_failed(&mut self, session: SessionId) -> bool {
        self.slot.on_start_failed(session)
    }

    /// A service match on `handle`. Returns the peer only for the first match.
    pub fn on_service_found(
        &mut self,
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        service_info: &[u8],
    ) -> Option<Peer> {
        let info = if service_info.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(service_info).into_owned())
        };
        self.slot.track_first(handle, Peer::new(peer, handle, info))
    }

    /// Send the handshake token to the tracked peer
    pub async fn send_handshake(&mut self, token: &str) -> NanResult<Option<MessageId>> {
        let Some(peer) = self.slot.peer.clone() else {
            return Ok(None);
        };
        self.next_message_id = self.next_message_id.wrapping_add(1);
        let message_id = MessageId::new(self.next_message_id);

        debug!("Sending handshake {} to {}", message_id, peer);
        self.slot
            .substrate
            .send_message(
                peer.discovery,
                peer.handle,
                message_id,
                token.as_bytes().to_vec(),
            )
            .await?;
        Ok(Some(message_id))
    }

    pub fn on_terminated(&mut self, handle: DiscoveryHandleId) -> bool {
        self.slot.on_terminated(handle)
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.slot.peer.as_ref()
    }

    pub fn is_live(&self, handle: DiscoveryHandleId) -> bool {
        self.slot.is_live(handle)
    }

    pub async fn close(&mut self) -> Option<DiscoveryHandleId> {
        self.slot.close().await
    }
}

// ----------------------------------------------------------------------------
// Role Dispatch
// ----------------------------------------------------------------------------

/// The role component an orchestrator was built for
pub enum RoleSession {
    Advertiser(Advertiser),
    Discoverer(Discoverer),
}

impl RoleSession {
    pub fn new(role: Role, substrate: Arc<dyn RadioSubstrate>) -> Self {
        match role {
            Role::Advertiser => RoleSession::Advertiser(Advertiser::new(substrate)),
            Role::Discoverer => RoleSession::Discoverer(Discoverer::new(substrate)),
        }
    }

    pub async fn start(
        &mut self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError> {
        match self {
            RoleSession::Advertiser(a) => a.start(session, descriptor, sink).await,
            RoleSession::Discoverer(d) => d.start(session, descriptor, sink).await,
        }
    }

    pub fn on_started(&mut self, session: SessionId, handle: DiscoveryHandleId) -> bool {
        match self {
            RoleSession::Advertiser(a) => a.on_started(session, handle),
            RoleSession::Discoverer(d) => d.on_started(session, handle),
        }
    }

    pub fn on_start_failed(&mut self, session: SessionId) -> bool {
        match self {
            RoleSession::Advertiser(a) => a.on_start_failed(session),
            RoleSession::Discoverer(d) => d.on_start_failed(session),
        }
    }

    pub fn on_terminated(&mut self, handle: DiscoveryHandleId) -> bool {
        match self {
            RoleSession::Advertiser(a) => a.on_terminated(handle),
            RoleSession::Discoverer(d) => d.on_terminated(handle),
        }
    }

    pub fn is_live(&self, handle: DiscoveryHandleId) -> bool {
        match self {
            RoleSession::Advertiser(a) => a.is_live(handle),
            RoleSession::Discoverer(d) => d.is_live(handle),
        }
    }

    pub fn peer(&self) -> Option<&Peer> {
        match self {
            RoleSession::Advertiser(a) => a.peer(),
            RoleSession::Discoverer(d) => d.peer(),
        }
    }

    pub async fn close(&mut self) -> Option<DiscoveryHandleId> {
        match self {
            RoleSession::Advertiser(a) => a.close().await,
            RoleSession::Discoverer(d) => d.close().await,
        }
    }
}
