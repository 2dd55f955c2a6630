//! Session Orchestrator
//!
//! The single writer of session state. Commands from the UI and events from
//! the substrates, timers and the stream task all arrive on channels and are
//! processed one at a time, so no component is touched from two contexts.

use std::net::IpAddr;
use std::sync::Arc;

use nanlink_core::{
    AppEvent, AppEventSender, AttachError, Command, CommandReceiver, DiscoveryAddress,
    DiscoveryHandleId, Event, EventReceiver, EventSender, LinkError, LinkRequestId,
    LinkSubstrate, MessageId, NanConfig, NanError, NanResult, NonBlockingSend, OrchestratorState,
    PeerHandle, RadioSubstrate, ReleasedResource, Role, ServiceDescriptor, SessionId, Severity,
    StartError, StateEvent, StatusReport, StreamId,
};
use tracing::{debug, error, info, warn};

use crate::link::LinkNegotiator;
use crate::roles::RoleSession;
use crate::session::RadioSession;
use crate::stream::StreamChannel;

const DATA_PATH_ESTABLISHED: &str = "Data path established";
const DATA_PATH_NOT_ESTABLISHED: &str = "Data path not established";
const DATA_PATH_LOST: &str = "Data path lost";

/// Drives one role through attach, discovery, link and stream
pub struct SessionOrchestrator {
    role: Role,
    config: NanConfig,
    state: OrchestratorState,
    radio: RadioSession,
    role_session: RoleSession,
    link: LinkNegotiator,
    stream: StreamChannel,
    /// Sink handed to substrates, timers and the stream task
    event_sender: EventSender,
    command_receiver: CommandReceiver,
    event_receiver: EventReceiver,
    app_event_sender: AppEventSender,
    connect_attempt: u32,
    lines_sent: u64,
    lines_received: u64,
    running: bool,
    shutting_down: bool,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        config: NanConfig,
        radio: Arc<dyn RadioSubstrate>,
        link: Arc<dyn LinkSubstrate>,
        command_receiver: CommandReceiver,
        event_sender: EventSender,
        event_receiver: EventReceiver,
        app_event_sender: AppEventSender,
    ) -> Self {
        Self {
            role,
            state: OrchestratorState::Idle,
            radio: RadioSession::new(radio.clone()),
            role_session: RoleSession::new(role, radio),
            link: LinkNegotiator::new(link, config.link.clone()),
            stream: StreamChannel::new(config.stream.clone(), event_sender.clone()),
            config,
            event_sender,
            command_receiver,
            event_receiver,
            app_event_sender,
            connect_attempt: 0,
            lines_sent: 0,
            lines_received: 0,
            running: true,
            shutting_down: false,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Run until `Command::Shutdown`, the command channel closing, or a
    /// fatal error. Everything still held is released on the way out.
    pub async fn run(mut self) -> NanResult<()> {
        info!("Session orchestrator starting as {}", self.role);

        while self.running {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(cmd) => {
                            debug!("Command: {:?}", cmd);
                            if let Err(e) = self.process_command(cmd).await {
                                if self.report_error("command", e) {
                                    break;
                                }
                            }
                        }
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                event = self.event_receiver.recv() => {
                    // The orchestrator holds a sender itself, so the queue never closes
                    if let Some(evt) = event {
                        debug!("Event: {}", evt.name());
                        if let Err(e) = self.process_event(evt).await {
                            if self.report_error("event", e) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.shutting_down = true;
        if self.state != OrchestratorState::Idle {
            if let Err(e) = self.close_session(StateEvent::CloseRequested).await {
                warn!("Teardown on shutdown incomplete: {}", e);
            }
        }

        info!("Session orchestrator stopped");
        Ok(())
    }

    /// Returns true when the loop must stop
    fn report_error(&mut self, source: &str, e: NanError) -> bool {
        if e.is_fatal() {
            error!(
                "Unrecoverable error processing {}, shutting down orchestrator: {}",
                source, e
            );
            self.running = false;
            return true;
        }
        match e {
            NanError::StateTransition(e) => warn!("Dropping {}: {}", source, e),
            e => error!("Error processing {}: {}", source, e),
        }
        false
    }

    // ------------------------------------------------------------------------
    // State and Output Helpers
    // ------------------------------------------------------------------------

    fn accepts(&self, event: StateEvent) -> bool {
        self.state.transition(self.role, event).is_ok()
    }

    async fn apply(&mut self, event: StateEvent) -> NanResult<()> {
        let transition = self.state.transition(self.role, event)?;
        let from = self.state;
        self.state = transition.new_state;

        let audit = transition.audit_entry;
        info!(
            "{}: {} -> {} on {}",
            audit.role, audit.from_state, audit.to_state, audit.event
        );
        self.send_app_event(AppEvent::StateChanged {
            from,
            to: self.state,
        })
        .await
    }

    async fn send_app_event(&mut self, app_event: AppEvent) -> NanResult<()> {
        if self.shutting_down {
            // Nobody may be draining the UI channel any more
            if let Err(e) = self.app_event_sender.try_send_non_blocking(app_event) {
                debug!("App event dropped during shutdown: {}", e);
            }
            return Ok(());
        }
        self.app_event_sender
            .send(app_event)
            .await
            .map_err(|_| NanError::channel_error("App event channel closed"))
    }

    async fn notify<T: Into<String>>(&mut self, severity: Severity, message: T) -> NanResult<()> {
        self.send_app_event(AppEvent::notification(severity, message))
            .await
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn process_command(&mut self, command: Command) -> NanResult<()> {
        match command {
            Command::Attach => self.handle_attach().await,
            Command::Start { descriptor } => self.handle_start(descriptor).await,
            Command::RequestLink => self.handle_request_link().await,
            Command::Send { line } => self.handle_send(line).await,
            Command::RetryConnect => self.handle_retry_connect().await,
            Command::Close => self.close_session(StateEvent::CloseRequested).await,
            Command::GetStatus => {
                let report = self.status_report();
                self.send_app_event(AppEvent::StatusReport(report)).await
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                self.running = false;
                Ok(())
            }
        }
    }

    async fn handle_attach(&mut self) -> NanResult<()> {
        if self.state != OrchestratorState::Idle {
            let e = AttachError::AlreadyAttached;
            return self.notify(Severity::Warning, e.to_string()).await;
        }

        self.apply(StateEvent::AttachRequested).await?;
        if let Err(e) = self.radio.attach(self.event_sender.clone()).await {
            self.notify(Severity::Error, e.to_string()).await?;
            self.apply(StateEvent::AttachFailed).await?;
        }
        Ok(())
    }

    async fn handle_start(&mut self, descriptor: ServiceDescriptor) -> NanResult<()> {
        let session = match (self.state, self.radio.session_id()) {
            (OrchestratorState::Attached, Some(session)) => session,
            (OrchestratorState::Idle | OrchestratorState::Attaching, _) => {
                let e = StartError::NotAttached;
                return self.notify(Severity::Warning, e.to_string()).await;
            }
            _ => {
                let e = StartError::AlreadyStarted;
                return self.notify(Severity::Warning, e.to_string()).await;
            }
        };

        if let Err(e) = self
            .role_session
            .start(session, &descriptor, self.event_sender.clone())
            .await
        {
            warn!("Could not start {}: {}", self.role, e);
            self.notify(Severity::Error, e.to_string()).await?;
        }
        Ok(())
    }

    async fn handle_request_link(&mut self) -> NanResult<()> {
        if self.role == Role::Advertiser {
            return self
                .notify(
                    Severity::Warning,
                    "The advertiser requests its link when the first handshake arrives",
                )
                .await;
        }
        if self.state.holds_link() {
            return self
                .notify(Severity::Warning, LinkError::AlreadyPending.to_string())
                .await;
        }
        let peer = match (self.state, self.role_session.peer()) {
            (OrchestratorState::PeerFound, Some(peer)) => peer.clone(),
            _ => {
                return self
                    .notify(Severity::Warning, LinkError::NoPeer.to_string())
                    .await;
            }
        };

        match self.link.request(&peer, self.event_sender.clone()).await {
            Ok(_) => self.apply(StateEvent::LinkRequested).await,
            Err(e) => self.notify(Severity::Warning, e.to_string()).await,
        }
    }

    async fn handle_send(&mut self, line: String) -> NanResult<()> {
        if let Err(e) = self.stream.send(&line) {
            let reason = e.to_string();
            self.notify(
                Severity::Warning,
                format!("Failed to send message: {}", reason),
            )
            .await?;
            self.send_app_event(AppEvent::SendFailed { line, reason })
                .await?;
        }
        Ok(())
    }

    async fn handle_retry_connect(&mut self) -> NanResult<()> {
        let addr = self.link.state().and_then(|s| s.peer_address());
        match (self.state, addr, self.stream.stream_id()) {
            (OrchestratorState::LinkUp, Some(addr), None) => {
                self.connect_attempt = 0;
                self.open_stream(addr).await
            }
            _ => {
                self.notify(
                    Severity::Warning,
                    format!("Nothing to retry in state {}", self.state),
                )
                .await
            }
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    async fn process_event(&mut self, event: Event) -> NanResult<()> {
        match event {
            // ---- Radio session ----
            Event::Attached { session } => self.on_attached(session).await,
            Event::AttachFailed { session, error } => self.on_attach_failed(session, error).await,
            Event::IdentifierChanged { session, address } => {
                self.on_identifier(session, address).await
            }

            // ---- Discovery session ----
            Event::PublishStarted { session, handle } => {
                self.on_role_started(Role::Advertiser, session, handle).await
            }
            Event::SubscribeStarted { session, handle } => {
                self.on_role_started(Role::Discoverer, session, handle).await
            }
            Event::StartFailed { session, error } => {
                if self.role_session.on_start_failed(session) {
                    warn!("Substrate rejected {} start: {}", self.role, error);
                    self.notify(Severity::Error, error.to_string()).await?;
                }
                Ok(())
            }
            Event::MessageReceived {
                handle,
                peer,
                payload,
            } => self.on_message(handle, peer, payload).await,
            Event::ServiceDiscovered {
                handle,
                peer,
                service_info,
                ..
            } => self.on_service_found(handle, peer, service_info).await,
            Event::MessageSendSucceeded { handle, message_id } => {
                self.on_send_status(handle, message_id, true).await
            }
            Event::MessageSendFailed { handle, message_id } => {
                self.on_send_status(handle, message_id, false).await
            }
            Event::DiscoveryTerminated { handle } => self.on_discovery_terminated(handle).await,

            // ---- Link ----
            Event::LinkAvailable { request } => {
                if !self.link.on_available(request) {
                    debug!("Stale availability for {}", request);
                }
                Ok(())
            }
            Event::LinkCapabilitiesChanged {
                request,
                peer_address,
            } => self.on_capabilities(request, peer_address).await,
            Event::LinkUnavailable { request } => {
                if self.link.on_unavailable(request).await {
                    self.on_link_not_established().await?;
                }
                Ok(())
            }
            Event::LinkTimedOut { request } => {
                if self.link.on_timed_out(request).await {
                    let e = LinkError::Timeout {
                        after_ms: self.config.link.request_timeout_ms,
                    };
                    warn!("{}", e);
                    self.on_link_not_established().await?;
                }
                Ok(())
            }
            Event::LinkLost { request } => self.on_link_lost(request).await,

            // ---- Stream ----
            Event::StreamOpened { stream, remote } => {
                if self.stream.is_current(stream) && self.state == OrchestratorState::LinkUp {
                    info!("Stream connected to {:?}", remote);
                    self.connect_attempt = 0;
                    self.apply(StateEvent::StreamOpened).await?;
                }
                Ok(())
            }
            Event::StreamFailed { stream, error } => self.on_stream_failed(stream, error).await,
            Event::LineReceived { stream, line } => {
                if self.stream.is_current(stream) {
                    self.lines_received += 1;
                    self.send_app_event(AppEvent::LineReceived { line }).await?;
                }
                Ok(())
            }
            Event::ChannelClosed { stream, reason } => {
                self.on_channel_closed(stream, reason).await
            }
            Event::SendCompleted {
                stream,
                line,
                result,
            } => self.on_send_completed(stream, line, result).await,

            // ---- Timers ----
            Event::RetryConnect { request, attempt } => {
                let addr = self.link.state().and_then(|s| s.peer_address());
                match (addr, self.stream.stream_id()) {
                    (Some(addr), None)
                        if self.link.is_current(request)
                            && self.state == OrchestratorState::LinkUp =>
                    {
                        self.connect_attempt = attempt;
                        self.open_stream(addr).await
                    }
                    _ => {
                        debug!("Dropping stale connect retry for {}", request);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn on_attached(&mut self, session: SessionId) -> NanResult<()> {
        if self.radio.on_attached(session) && self.state == OrchestratorState::Attaching {
            self.apply(StateEvent::AttachSucceeded).await?;
        }
        Ok(())
    }

    async fn on_attach_failed(&mut self, session: SessionId, error: AttachError) -> NanResult<()> {
        if self.radio.on_attach_failed(session, &error) && self.state == OrchestratorState::Attaching
        {
            self.notify(Severity::Error, error.to_string()).await?;
            self.apply(StateEvent::AttachFailed).await?;
        }
        Ok(())
    }

    async fn on_identifier(&mut self, session: SessionId, address: DiscoveryAddress) -> NanResult<()> {
        if self.radio.on_identifier(session, address.clone()) {
            self.send_app_event(AppEvent::IdentifierReady { address })
                .await?;
        }
        Ok(())
    }

    async fn on_role_started(
        &mut self,
        started: Role,
        session: SessionId,
        handle: DiscoveryHandleId,
    ) -> NanResult<()> {
        if started != self.role || !self.radio.is_current(session) {
            debug!("Ignoring {} start for {}", started, handle);
            return Ok(());
        }
        if self.role_session.on_started(session, handle) && self.state == OrchestratorState::Attached
        {
            self.apply(StateEvent::RoleStarted).await?;
        }
        Ok(())
    }

    /// Advertiser: the first message on a live session is the handshake and
    /// triggers the link request
    async fn on_message(
        &mut self,
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        payload: Vec<u8>,
    ) -> NanResult<()> {
        let message = String::from_utf8_lossy(&payload).into_owned();
        if self.role == Role::Discoverer {
            info!("Message from {} on {}: {}", peer, handle, message);
            return Ok(());
        }
        if !self.accepts(StateEvent::HandshakeReceived) {
            debug!(
                "Ignoring message from {} in state {}: {}",
                peer, self.state, message
            );
            return Ok(());
        }
        let RoleSession::Advertiser(advertiser) = &mut self.role_session else {
            return Ok(());
        };
        let Some(peer) = advertiser.on_message(handle, peer) else {
            return Ok(());
        };

        info!("Handshake '{}' from {}", message, peer);
        self.send_app_event(AppEvent::HandshakeReceived {
            peer: peer.clone(),
            message,
        })
        .await?;

        match self.link.request(&peer, self.event_sender.clone()).await {
            Ok(_) => self.apply(StateEvent::HandshakeReceived).await,
            Err(e) => {
                if let RoleSession::Advertiser(advertiser) = &mut self.role_session {
                    advertiser.clear_peer();
                }
                self.notify(Severity::Warning, e.to_string()).await
            }
        }
    }

    /// Discoverer: the first match is tracked and greeted
    async fn on_service_found(
        &mut self,
        handle: DiscoveryHandleId,
        peer: PeerHandle,
        service_info: Vec<u8>,
    ) -> NanResult<()> {
        if !self.accepts(StateEvent::PeerDiscovered) {
            debug!("Ignoring discovery of {} in state {}", peer, self.state);
            return Ok(());
        }
        let RoleSession::Discoverer(discoverer) = &mut self.role_session else {
            return Ok(());
        };
        let Some(peer) = discoverer.on_service_found(handle, peer, &service_info) else {
            return Ok(());
        };

        info!("Discovered {}", peer);
        self.apply(StateEvent::PeerDiscovered).await?;
        self.send_app_event(AppEvent::PeerDiscovered { peer }).await?;

        let token = self.config.handshake.token.clone();
        let sent = match &mut self.role_session {
            RoleSession::Discoverer(discoverer) => discoverer.send_handshake(&token).await,
            RoleSession::Advertiser(_) => Ok(None),
        };
        if let Err(e) = sent {
            warn!("Handshake send failed: {}", e);
            self.notify(Severity::Warning, format!("Failed to send handshake: {}", e))
                .await?;
        }
        Ok(())
    }

    async fn on_send_status(
        &mut self,
        handle: DiscoveryHandleId,
        message_id: MessageId,
        delivered: bool,
    ) -> NanResult<()> {
        if !self.role_session.is_live(handle) {
            return Ok(());
        }
        if delivered {
            info!("Message {} delivered", message_id);
        } else {
            warn!("Message {} was not delivered", message_id);
        }
        self.send_app_event(AppEvent::HandshakeStatus {
            message_id,
            delivered,
        })
        .await
    }

    async fn on_discovery_terminated(&mut self, handle: DiscoveryHandleId) -> NanResult<()> {
        if !self.role_session.on_terminated(handle) {
            return Ok(());
        }
        self.notify(Severity::Warning, "Discovery session terminated")
            .await?;

        if self.state.holds_link() {
            return self.close_session(StateEvent::DiscoveryTerminated).await;
        }
        if self.accepts(StateEvent::DiscoveryTerminated) {
            // Drop the dead handle so the role can be started again
            self.role_session.close().await;
            self.apply(StateEvent::DiscoveryTerminated).await?;
        }
        Ok(())
    }

    async fn on_capabilities(
        &mut self,
        request: LinkRequestId,
        peer_address: Option<IpAddr>,
    ) -> NanResult<()> {
        let Some(addr) = self.link.on_capabilities(request, peer_address) else {
            return Ok(());
        };
        if self.state != OrchestratorState::LinkPending {
            return Ok(());
        }

        self.apply(StateEvent::LinkUp).await?;
        self.send_app_event(AppEvent::LinkEstablished { peer_address: addr })
            .await?;
        self.notify(Severity::Info, DATA_PATH_ESTABLISHED).await?;

        self.connect_attempt = 0;
        self.open_stream(addr).await
    }

    async fn on_link_not_established(&mut self) -> NanResult<()> {
        if self.state != OrchestratorState::LinkPending {
            return Ok(());
        }
        if let RoleSession::Advertiser(advertiser) = &mut self.role_session {
            advertiser.clear_peer();
        }
        self.apply(StateEvent::LinkUnavailable).await?;
        self.notify(Severity::Warning, DATA_PATH_NOT_ESTABLISHED)
            .await
    }

    async fn on_link_lost(&mut self, request: LinkRequestId) -> NanResult<()> {
        if !self.link.on_lost(request) || !self.state.holds_link() {
            return Ok(());
        }
        self.notify(Severity::Warning, DATA_PATH_LOST).await?;
        self.close_session(StateEvent::LinkLost).await
    }

    // ------------------------------------------------------------------------
    // Stream
    // ------------------------------------------------------------------------

    /// Listen (advertiser) or connect (discoverer) once the link is up
    async fn open_stream(&mut self, peer_address: IpAddr) -> NanResult<()> {
        let opened = match self.role {
            Role::Advertiser => self.stream.listen().await,
            Role::Discoverer => {
                self.connect_attempt += 1;
                debug!(
                    "Connect attempt {}/{} to {}",
                    self.connect_attempt, self.config.link.connect_attempts, peer_address
                );
                self.stream.connect(peer_address)
            }
        };
        if let Err(e) = opened {
            warn!("Could not open stream: {}", e);
            self.notify(Severity::Error, e.to_string()).await?;
        }
        Ok(())
    }

    async fn on_stream_failed(&mut self, stream: StreamId, error: String) -> NanResult<()> {
        if !self.stream.on_failed(stream) || self.state != OrchestratorState::LinkUp {
            return Ok(());
        }
        warn!("{} failed: {}", stream, error);

        let request = self.link.request_id();
        match request {
            Some(request)
                if self.role == Role::Discoverer
                    && self.connect_attempt < self.config.link.connect_attempts =>
            {
                let delay = self.config.link.connect_retry_delay();
                let attempt = self.connect_attempt + 1;
                let sink = self.event_sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sink.send(Event::RetryConnect { request, attempt });
                });
                Ok(())
            }
            _ => {
                self.notify(
                    Severity::Error,
                    format!("Could not connect to peer: {}", error),
                )
                .await
            }
        }
    }

    async fn on_channel_closed(&mut self, stream: StreamId, reason: Option<String>) -> NanResult<()> {
        if !self.stream.on_closed(stream) {
            return Ok(());
        }
        match &reason {
            Some(reason) => warn!("{} closed: {}", stream, reason),
            None => info!("{} closed by peer", stream),
        }
        if self.state == OrchestratorState::Streaming {
            self.close_session(StateEvent::ChannelClosed).await?;
        }
        Ok(())
    }

    async fn on_send_completed(
        &mut self,
        stream: StreamId,
        line: String,
        result: Result<(), String>,
    ) -> NanResult<()> {
        if !self.stream.is_current(stream) {
            return Ok(());
        }
        match result {
            Ok(()) => {
                self.lines_sent += 1;
                self.send_app_event(AppEvent::LineSent { line }).await
            }
            Err(reason) => {
                self.notify(
                    Severity::Warning,
                    format!("Failed to send message: {}", reason),
                )
                .await?;
                self.send_app_event(AppEvent::SendFailed { line, reason })
                    .await
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Enter `Closing`, release everything, and settle in `Idle`
    async fn close_session(&mut self, cause: StateEvent) -> NanResult<()> {
        self.apply(cause).await?;
        self.teardown().await?;
        self.apply(StateEvent::TeardownComplete).await
    }

    /// Stream, then discovery session, then link, then radio session.
    /// Each step is a no-op when the resource is not held.
    async fn teardown(&mut self) -> NanResult<()> {
        if let Some(id) = self.stream.close().await {
            self.released(ReleasedResource::Stream(id)).await?;
        }
        if let Some(id) = self.role_session.close().await {
            self.released(ReleasedResource::DiscoverySession(id)).await?;
        }
        if let Some(id) = self.link.release().await {
            self.released(ReleasedResource::Link(id)).await?;
        }
        if let Some(id) = self.radio.close().await {
            self.released(ReleasedResource::RadioSession(id)).await?;
        }
        self.connect_attempt = 0;
        Ok(())
    }

    async fn released(&mut self, resource: ReleasedResource) -> NanResult<()> {
        debug!("Released {}", resource);
        self.send_app_event(AppEvent::ResourceReleased { resource })
            .await
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            role: self.role,
            state: self.state,
            identifier: self.radio.identifier().cloned(),
            peer: self
                .role_session
                .peer()
                .or_else(|| self.link.peer())
                .cloned(),
            link: self.link.state(),
            stream_open: self.stream.is_open(),
            lines_sent: self.lines_sent,
            lines_received: self.lines_received,
        }
    }
}
