//! In-memory airspace
//!
//! Devices created from one `Airspace` see each other's publish and
//! subscribe sessions, exchange discovery messages and pair up link
//! requests. Everything happens synchronously under one lock, and events go
//! straight onto the sinks the caller handed in.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use nanlink_core::{
    AttachError, DiscoveryAddress, DiscoveryHandleId, Event, EventSender, LinkError,
    LinkRequestId, LinkSubstrate, MessageId, NanError, NanResult, PeerHandle, RadioSubstrate,
    Role, ServiceDescriptor, SessionId, StartError,
};
use tracing::{debug, trace};

use crate::recorder::Recorder;

// ----------------------------------------------------------------------------
// Fault Configuration
// ----------------------------------------------------------------------------

/// Failure modes applied to every device in the airspace
#[derive(Debug, Clone, Default)]
pub struct AirspaceFaults {
    /// `attach` refuses up front
    pub attach_refusal: Option<AttachError>,
    /// `attach` is accepted, then reports `AttachFailed`
    pub attach_failure: Option<AttachError>,
    /// `publish`/`subscribe` refuse up front
    pub start_rejection: Option<StartError>,
    /// Discovery messages are reported as failed and never delivered
    pub drop_messages: bool,
    /// Link requests report `LinkUnavailable`
    pub link_unavailable: bool,
    /// Link requests are accepted and then never answered
    pub link_silent: bool,
}

impl AirspaceFaults {
    /// Everything works
    pub fn ideal() -> Self {
        Self::default()
    }

    /// Discovery works but no data path ever comes up
    pub fn no_data_path() -> Self {
        Self {
            link_unavailable: true,
            ..Self::default()
        }
    }

    /// The radio is switched off
    pub fn radio_off() -> Self {
        Self {
            attach_refusal: Some(AttachError::Unavailable),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

struct SessionRecord {
    device: usize,
}

struct DiscoveryRecord {
    device: usize,
    session: SessionId,
    role: Role,
    descriptor: ServiceDescriptor,
    sink: EventSender,
    open: bool,
}

struct LinkRecord {
    device: usize,
    request: LinkRequestId,
    local: DiscoveryHandleId,
    remote: DiscoveryHandleId,
    sink: EventSender,
    /// Index of the matching request on the other side
    paired: Option<usize>,
    released: bool,
}

#[derive(Default)]
struct AirspaceState {
    devices: Vec<String>,
    peer_addresses: HashMap<usize, IpAddr>,
    faults: AirspaceFaults,
    next_session: u64,
    next_discovery: u64,
    next_peer: u32,
    sessions: HashMap<SessionId, SessionRecord>,
    discoveries: HashMap<DiscoveryHandleId, DiscoveryRecord>,
    /// (observer, remote) -> handle the observer uses for the remote
    peers: HashMap<(DiscoveryHandleId, DiscoveryHandleId), PeerHandle>,
    /// (observer, handle) -> remote discovery session
    peer_index: HashMap<(DiscoveryHandleId, PeerHandle), DiscoveryHandleId>,
    links: Vec<LinkRecord>,
}

impl AirspaceState {
    fn device_index(&mut self, name: &str) -> usize {
        match self.devices.iter().position(|d| d == name) {
            Some(index) => index,
            None => {
                self.devices.push(name.to_string());
                self.devices.len() - 1
            }
        }
    }

    fn peer_handle(&mut self, observer: DiscoveryHandleId, remote: DiscoveryHandleId) -> PeerHandle {
        if let Some(handle) = self.peers.get(&(observer, remote)) {
            return *handle;
        }
        self.next_peer += 1;
        let handle = PeerHandle::new(self.next_peer);
        self.peers.insert((observer, remote), handle);
        self.peer_index.insert((observer, handle), remote);
        handle
    }

    fn peer_address_for(&self, device: usize) -> IpAddr {
        self.peer_addresses
            .get(&device)
            .copied()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn open_discoveries(&self, role: Role, service_name: &str, except: usize) -> Vec<DiscoveryHandleId> {
        let mut found: Vec<_> = self
            .discoveries
            .iter()
            .filter(|(_, d)| {
                d.open
                    && d.role == role
                    && d.device != except
                    && d.descriptor.service_name == service_name
            })
            .map(|(id, _)| *id)
            .collect();
        found.sort();
        found
    }

    /// Tell subscriber `sub` about publisher `publ`
    fn announce(&mut self, sub: DiscoveryHandleId, publ: DiscoveryHandleId) {
        let peer = self.peer_handle(sub, publ);
        let (info, filter) = match self.discoveries.get(&publ) {
            Some(p) => (
                p.descriptor.service_info_bytes(),
                p.descriptor
                    .match_filter
                    .as_ref()
                    .map(|f| vec![f.as_bytes().to_vec()])
                    .unwrap_or_default(),
            ),
            None => return,
        };
        if let Some(s) = self.discoveries.get(&sub) {
            trace!("{} discovers {} as {}", sub, publ, peer);
            let _ = s.sink.send(Event::ServiceDiscovered {
                handle: sub,
                peer,
                service_info: info,
                match_filter: filter,
            });
        }
    }

    fn start(
        &mut self,
        device: usize,
        role: Role,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError> {
        if let Some(e) = self.faults.start_rejection.clone() {
            return Err(e);
        }
        match self.sessions.get(&session) {
            Some(record) if record.device == device => {}
            _ => return Err(StartError::NotAttached),
        }

        self.next_discovery += 1;
        let handle = DiscoveryHandleId::new(self.next_discovery);
        let started = match role {
            Role::Advertiser => Event::PublishStarted { session, handle },
            Role::Discoverer => Event::SubscribeStarted { session, handle },
        };
        let _ = sink.send(started);
        self.discoveries.insert(
            handle,
            DiscoveryRecord {
                device,
                session,
                role,
                descriptor: descriptor.clone(),
                sink,
                open: true,
            },
        );

        let name = descriptor.service_name.as_str();
        match role {
            Role::Advertiser => {
                for sub in self.open_discoveries(Role::Discoverer, name, device) {
                    self.announce(sub, handle);
                }
            }
            Role::Discoverer => {
                for publ in self.open_discoveries(Role::Advertiser, name, device) {
                    self.announce(handle, publ);
                }
            }
        }
        Ok(())
    }

    fn notify_link(&self, index: usize, event: impl Fn(LinkRequestId) -> Event) {
        if let Some(link) = self.links.get(index) {
            let _ = link.sink.send(event(link.request));
        }
    }

    fn bring_up(&self, index: usize) {
        let Some(link) = self.links.get(index) else {
            return;
        };
        let addr = self.peer_address_for(link.device);
        let _ = link.sink.send(Event::LinkAvailable {
            request: link.request,
        });
        let _ = link.sink.send(Event::LinkCapabilitiesChanged {
            request: link.request,
            peer_address: Some(addr),
        });
    }
}

// ----------------------------------------------------------------------------
// Airspace
// ----------------------------------------------------------------------------

/// Shared medium for in-memory devices
#[derive(Clone, Default)]
pub struct Airspace {
    state: Arc<Mutex<AirspaceState>>,
    recorder: Recorder,
}

impl Airspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: AirspaceFaults) -> Self {
        let airspace = Self::new();
        airspace.lock().faults = faults;
        airspace
    }

    fn lock(&self) -> MutexGuard<'_, AirspaceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Device named `name`, created on first use
    pub fn device(&self, name: &str) -> Arc<Device> {
        let index = self.lock().device_index(name);
        Arc::new(Device {
            index,
            name: name.to_string(),
            state: self.state.clone(),
            recorder: self.recorder.clone(),
        })
    }

    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    pub fn set_attach_refusal(&self, refusal: Option<AttachError>) {
        self.lock().faults.attach_refusal = refusal;
    }

    pub fn set_attach_failure(&self, failure: Option<AttachError>) {
        self.lock().faults.attach_failure = failure;
    }

    pub fn set_start_rejection(&self, rejection: Option<StartError>) {
        self.lock().faults.start_rejection = rejection;
    }

    pub fn set_drop_messages(&self, drop: bool) {
        self.lock().faults.drop_messages = drop;
    }

    pub fn set_link_unavailable(&self, unavailable: bool) {
        self.lock().faults.link_unavailable = unavailable;
    }

    pub fn set_link_silent(&self, silent: bool) {
        self.lock().faults.link_silent = silent;
    }

    /// Address reported to `device` for its link peer (default 127.0.0.1)
    pub fn set_peer_address(&self, device: &str, addr: IpAddr) {
        let mut state = self.lock();
        let index = state.device_index(device);
        state.peer_addresses.insert(index, addr);
    }

    /// Drop every established link of `device`; both sides see `LinkLost`
    pub fn lose_links(&self, device: &str) {
        let state = self.lock();
        let Some(index) = state.devices.iter().position(|d| d == device) else {
            return;
        };
        for (i, link) in state.links.iter().enumerate() {
            if link.device != index || link.released {
                continue;
            }
            if let Some(other) = link.paired {
                debug!("Losing {} of {}", link.request, device);
                state.notify_link(i, |request| Event::LinkLost { request });
                state.notify_link(other, |request| Event::LinkLost { request });
            }
        }
    }

    /// End every open discovery session of `device` from the substrate side
    pub fn terminate_discovery(&self, device: &str) {
        let mut state = self.lock();
        let Some(index) = state.devices.iter().position(|d| d == device) else {
            return;
        };
        for (handle, record) in state.discoveries.iter_mut() {
            if record.device == index && record.open {
                record.open = false;
                let _ = record.sink.send(Event::DiscoveryTerminated { handle: *handle });
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

/// One device's view of the airspace; implements both substrate traits
pub struct Device {
    index: usize,
    name: String,
    state: Arc<Mutex<AirspaceState>>,
    recorder: Recorder,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier the device reports after attaching
    pub fn address(&self) -> DiscoveryAddress {
        DiscoveryAddress::new(vec![0x02, 0x00, 0x00, 0x00, 0x00, (self.index + 1) as u8])
    }

    fn lock(&self) -> MutexGuard<'_, AirspaceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl RadioSubstrate for Device {
    async fn attach(&self, sink: EventSender) -> Result<SessionId, AttachError> {
        let mut state = self.lock();
        if let Some(e) = state.faults.attach_refusal.clone() {
            self.recorder.record("attach", &self.name, "refused");
            return Err(e);
        }

        state.next_session += 1;
        let session = SessionId::new(state.next_session);
        self.recorder.record("attach", &self.name, session);

        if let Some(error) = state.faults.attach_failure.clone() {
            let _ = sink.send(Event::AttachFailed { session, error });
            return Ok(session);
        }
        state
            .sessions
            .insert(session, SessionRecord { device: self.index });
        let _ = sink.send(Event::Attached { session });
        let _ = sink.send(Event::IdentifierChanged {
            session,
            address: self.address(),
        });
        Ok(session)
    }

    async fn detach(&self, session: SessionId) {
        self.recorder.record("detach", &self.name, session);
        let mut state = self.lock();
        if state.sessions.remove(&session).is_none() {
            return;
        }
        for record in state.discoveries.values_mut() {
            if record.session == session {
                record.open = false;
            }
        }
    }

    async fn publish(
        &self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError> {
        self.recorder
            .record("publish", &self.name, &descriptor.service_name);
        self.lock()
            .start(self.index, Role::Advertiser, session, descriptor, sink)
    }

    async fn subscribe(
        &self,
        session: SessionId,
        descriptor: &ServiceDescriptor,
        sink: EventSender,
    ) -> Result<(), StartError> {
        self.recorder
            .record("subscribe", &self.name, &descriptor.service_name);
        self.lock()
            .start(self.index, Role::Discoverer, session, descriptor, sink)
    }

    async fn send_message(
        &self,
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        message_id: MessageId,
        payload: Vec<u8>,
    ) -> NanResult<()> {
        self.recorder
            .record("send_message", &self.name, format!("{} to {}", handle, peer));
        let mut state = self.lock();
        let local_sink = match state.discoveries.get(&handle) {
            Some(record) if record.open && record.device == self.index => record.sink.clone(),
            _ => return Err(NanError::substrate(format!("{} is not open", handle))),
        };

        let remote = state
            .peer_index
            .get(&(handle, peer))
            .copied()
            .filter(|r| state.discoveries.get(r).is_some_and(|d| d.open));
        let delivered = match remote {
            Some(remote) if !state.faults.drop_messages => {
                let back = state.peer_handle(remote, handle);
                if let Some(record) = state.discoveries.get(&remote) {
                    let _ = record.sink.send(Event::MessageReceived {
                        handle: remote,
                        peer: back,
                        payload,
                    });
                }
                true
            }
            _ => false,
        };

        let _ = if delivered {
            local_sink.send(Event::MessageSendSucceeded { handle, message_id })
        } else {
            local_sink.send(Event::MessageSendFailed { handle, message_id })
        };
        Ok(())
    }

    async fn close_discovery(&self, handle: DiscoveryHandleId) {
        self.recorder.record("close_discovery", &self.name, handle);
        if let Some(record) = self.lock().discoveries.get_mut(&handle) {
            record.open = false;
        }
    }
}

#[async_trait::async_trait]
impl LinkSubstrate for Device {
    async fn request_link(
        &self,
        request: LinkRequestId,
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        sink: EventSender,
    ) -> Result<(), LinkError> {
        self.recorder.record("request_link", &self.name, request);
        let mut state = self.lock();
        let Some(remote) = state.peer_index.get(&(handle, peer)).copied() else {
            return Err(LinkError::NoPeer);
        };
        if state.faults.link_unavailable {
            let _ = sink.send(Event::LinkUnavailable { request });
            return Ok(());
        }

        state.links.push(LinkRecord {
            device: self.index,
            request,
            local: handle,
            remote,
            sink,
            paired: None,
            released: false,
        });
        let index = state.links.len() - 1;
        if state.faults.link_silent {
            return Ok(());
        }

        // A link comes up once both sides have asked for it
        let counterpart = state.links.iter().position(|l| {
            !l.released && l.paired.is_none() && l.local == remote && l.remote == handle
        });
        if let Some(other) = counterpart {
            debug!("Pairing link requests {} and {}", index, other);
            state.links[index].paired = Some(other);
            state.links[other].paired = Some(index);
            state.bring_up(other);
            state.bring_up(index);
        }
        Ok(())
    }

    async fn release_link(&self, request: LinkRequestId) {
        self.recorder.record("release_link", &self.name, request);
        let mut state = self.lock();
        let found = state
            .links
            .iter()
            .position(|l| l.device == self.index && l.request == request && !l.released);
        let Some(index) = found else {
            return;
        };
        state.links[index].released = true;
        if let Some(other) = state.links[index].paired.take() {
            state.links[other].paired = None;
            state.notify_link(other, |request| Event::LinkLost { request });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanlink_core::{create_event_channel, EventReceiver};

    fn drain(events: &mut EventReceiver) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn started(
        device: &Device,
        descriptor: ServiceDescriptor,
    ) -> (EventReceiver, EventSender, DiscoveryHandleId) {
        let (sink, mut events) = create_event_channel();
        let session = device.attach(sink.clone()).await.unwrap();
        let result = match descriptor.role {
            Role::Advertiser => device.publish(session, &descriptor, sink.clone()).await,
            Role::Discoverer => device.subscribe(session, &descriptor, sink.clone()).await,
        };
        result.unwrap();
        let handle = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                Event::PublishStarted { handle, .. } | Event::SubscribeStarted { handle, .. } => {
                    Some(handle)
                }
                _ => None,
            })
            .unwrap();
        (events, sink, handle)
    }

    #[tokio::test]
    async fn test_attach_reports_identifier() {
        let airspace = Airspace::new();
        let device = airspace.device("a");
        let (sink, mut events) = create_event_channel();
        let session = device.attach(sink).await.unwrap();

        let events = drain(&mut events);
        assert_eq!(events[0], Event::Attached { session });
        assert_eq!(
            events[1],
            Event::IdentifierChanged {
                session,
                address: device.address()
            }
        );
    }

    #[tokio::test]
    async fn test_subscriber_discovers_publisher_and_messages_flow() {
        let airspace = Airspace::new();
        let publisher = airspace.device("pub");
        let subscriber = airspace.device("sub");

        let (mut pub_events, _pub_sink, pub_handle) =
            started(&publisher, ServiceDescriptor::publish("svc").with_service_info("v1")).await;
        let (mut sub_events, _sub_sink, sub_handle) =
            started(&subscriber, ServiceDescriptor::subscribe("svc")).await;

        let peer = match drain(&mut sub_events).pop() {
            Some(Event::ServiceDiscovered {
                handle,
                peer,
                service_info,
                ..
            }) => {
                assert_eq!(handle, sub_handle);
                assert_eq!(service_info, b"v1".to_vec());
                peer
            }
            other => panic!("expected discovery, got {:?}", other),
        };

        subscriber
            .send_message(sub_handle, peer, MessageId::new(1), b"hello".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut sub_events).as_slice(),
            [Event::MessageSendSucceeded { .. }]
        ));
        assert!(matches!(
            drain(&mut pub_events).as_slice(),
            [Event::MessageReceived { handle, payload, .. }]
                if *handle == pub_handle && payload == b"hello"
        ));
    }

    #[tokio::test]
    async fn test_links_pair_and_release_reports_loss() {
        let airspace = Airspace::new();
        airspace.set_peer_address("sub", "fe80::1".parse().unwrap());
        let publisher = airspace.device("pub");
        let subscriber = airspace.device("sub");
        let (mut pub_events, pub_sink, pub_handle) =
            started(&publisher, ServiceDescriptor::publish("svc")).await;
        let (mut sub_events, sub_sink, sub_handle) =
            started(&subscriber, ServiceDescriptor::subscribe("svc")).await;

        let sub_peer = match drain(&mut sub_events).pop() {
            Some(Event::ServiceDiscovered { peer, .. }) => peer,
            other => panic!("expected discovery, got {:?}", other),
        };
        subscriber
            .send_message(sub_handle, sub_peer, MessageId::new(1), b"hi".to_vec())
            .await
            .unwrap();
        let pub_peer = match drain(&mut pub_events).pop() {
            Some(Event::MessageReceived { peer, .. }) => peer,
            other => panic!("expected message, got {:?}", other),
        };

        let pub_request = LinkRequestId::new(1);
        let sub_request = LinkRequestId::new(1);
        publisher
            .request_link(pub_request, pub_handle, pub_peer, pub_sink)
            .await
            .unwrap();
        assert!(drain(&mut pub_events).is_empty());

        subscriber
            .request_link(sub_request, sub_handle, sub_peer, sub_sink)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut sub_events),
            vec![
                Event::LinkAvailable {
                    request: sub_request
                },
                Event::LinkCapabilitiesChanged {
                    request: sub_request,
                    peer_address: Some("fe80::1".parse().unwrap()),
                },
            ]
        );
        assert_eq!(drain(&mut pub_events).len(), 2);

        subscriber.release_link(sub_request).await;
        assert_eq!(
            drain(&mut pub_events),
            vec![Event::LinkLost {
                request: pub_request
            }]
        );
        assert_eq!(airspace.recorder().calls_matching("release_link").len(), 1);
    }

    #[tokio::test]
    async fn test_link_unavailable_fault() {
        let airspace = Airspace::with_faults(AirspaceFaults::no_data_path());
        let publisher = airspace.device("pub");
        let subscriber = airspace.device("sub");
        let _publisher = started(&publisher, ServiceDescriptor::publish("svc")).await;
        let (mut sub_events, sub_sink, sub_handle) =
            started(&subscriber, ServiceDescriptor::subscribe("svc")).await;
        let peer = match drain(&mut sub_events).pop() {
            Some(Event::ServiceDiscovered { peer, .. }) => peer,
            other => panic!("expected discovery, got {:?}", other),
        };

        let request = LinkRequestId::new(1);
        subscriber
            .request_link(request, sub_handle, peer, sub_sink)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut sub_events),
            vec![Event::LinkUnavailable { request }]
        );
    }

    #[tokio::test]
    async fn test_terminate_discovery() {
        let airspace = Airspace::new();
        let device = airspace.device("a");
        let (mut events, _sink, handle) =
            started(&device, ServiceDescriptor::subscribe("svc")).await;

        airspace.terminate_discovery("a");
        assert_eq!(
            drain(&mut events),
            vec![Event::DiscoveryTerminated { handle }]
        );
        airspace.terminate_discovery("a");
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_radio_off_refuses_attach() {
        let airspace = Airspace::with_faults(AirspaceFaults::radio_off());
        let (sink, _events) = create_event_channel();
        assert_eq!(
            airspace.device("a").attach(sink).await,
            Err(AttachError::Unavailable)
        );
        assert_eq!(
            airspace.recorder().calls(),
            vec!["attach(a, refused)".to_string()]
        );
    }
}
