//! Link negotiation
//!
//! Holds the one link request an orchestrator may have outstanding, arms a
//! timeout for it, and folds the substrate's link events into `LinkState`.

use std::net::IpAddr;
use std::sync::Arc;

use nanlink_core::{
    Event, EventSender, LinkConfig, LinkError, LinkRequestId, LinkState, LinkSubstrate, Peer,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct LinkRecord {
    request: LinkRequestId,
    peer: Peer,
    state: LinkState,
    timeout: Option<JoinHandle<()>>,
}

impl LinkRecord {
    fn disarm(&mut self) {
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
    }
}

/// Negotiates the single ephemeral link to a discovered peer
pub struct LinkNegotiator {
    substrate: Arc<dyn LinkSubstrate>,
    config: LinkConfig,
    next_request: u64,
    current: Option<LinkRecord>,
}

impl LinkNegotiator {
    pub fn new(substrate: Arc<dyn LinkSubstrate>, config: LinkConfig) -> Self {
        Self {
            substrate,
            config,
            next_request: 0,
            current: None,
        }
    }

    pub fn state(&self) -> Option<LinkState> {
        self.current.as_ref().map(|r| r.state)
    }

    pub fn request_id(&self) -> Option<LinkRequestId> {
        self.current.as_ref().map(|r| r.request)
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.current.as_ref().map(|r| &r.peer)
    }

    pub fn is_current(&self, request: LinkRequestId) -> bool {
        self.request_id() == Some(request)
    }

    /// Request a link to `peer`. Only one request may exist at a time.
    pub async fn request(
        &mut self,
        peer: &Peer,
        sink: EventSender,
    ) -> Result<LinkRequestId, LinkError> {
        if let Some(record) = &self.current {
            debug!("Link {} still held, rejecting new request", record.request);
            return Err(LinkError::AlreadyPending);
        }

        self.next_request += 1;
        let request = LinkRequestId::new(self.next_request);
        self.substrate
            .request_link(request, peer.discovery, peer.handle, sink.clone())
            .await?;
        info!("Requested {} to {}", request, peer);

        let wait = self.config.request_timeout();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = sink.send(Event::LinkTimedOut { request });
        });

        self.current = Some(LinkRecord {
            request,
            peer: peer.clone(),
            state: LinkState::Requesting,
            timeout: Some(timeout),
        });
        Ok(request)
    }

    fn current_mut(&mut self, request: LinkRequestId) -> Option<&mut LinkRecord> {
        self.current.as_mut().filter(|r| r.request == request)
    }

    /// Link came up; false if stale
    pub fn on_available(&mut self, request: LinkRequestId) -> bool {
        let Some(record) = self.current_mut(request) else {
            return false;
        };
        if record.state != LinkState::Requesting {
            return false;
        }
        record.disarm();
        record.state = LinkState::Available;
        debug!("{} available", request);
        true
    }

    /// Returns the peer address the first time a resolvable one arrives
    pub fn on_capabilities(
        &mut self,
        request: LinkRequestId,
        peer_address: Option<IpAddr>,
    ) -> Option<IpAddr> {
        let record = self.current_mut(request)?;
        match (record.state, peer_address) {
            (LinkState::Requesting | LinkState::Available, Some(addr)) => {
                record.disarm();
                record.state = LinkState::CapabilitiesKnown(addr);
                info!("{} resolved peer address {}", request, addr);
                Some(addr)
            }
            (LinkState::Requesting | LinkState::Available, None) => {
                debug!("{} capabilities without a resolvable address", request);
                None
            }
            _ => None,
        }
    }

    /// Link never came up. Releases the request; false if stale or the link
    /// was already available.
    pub async fn on_unavailable(&mut self, request: LinkRequestId) -> bool {
        match self.current_mut(request) {
            Some(record) if record.state == LinkState::Requesting => {
                record.state = LinkState::Unavailable;
            }
            _ => return false,
        }
        warn!("{} unavailable", request);
        self.release().await;
        true
    }

    /// Timeout elapsed; counts as unavailable if nothing arrived yet
    pub async fn on_timed_out(&mut self, request: LinkRequestId) -> bool {
        if self.state() != Some(LinkState::Requesting) || !self.is_current(request) {
            return false;
        }
        warn!(
            "{} timed out after {}ms",
            request, self.config.request_timeout_ms
        );
        self.on_unavailable(request).await
    }

    /// Link lost after it was available. The caller runs teardown, which
    /// ends in `release`.
    pub fn on_lost(&mut self, request: LinkRequestId) -> bool {
        let Some(record) = self.current_mut(request) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }
        record.disarm();
        record.state = LinkState::Lost;
        warn!("{} lost", request);
        true
    }

    /// Release the current request, if any. Idempotent.
    pub async fn release(&mut self) -> Option<LinkRequestId> {
        let mut record = self.current.take()?;
        record.disarm();
        debug!("Releasing {}", record.request);
        self.substrate.release_link(record.request).await;
        Some(record.request)
    }
}

impl Drop for LinkNegotiator {
    fn drop(&mut self) {
        if let Some(record) = self.current.as_mut() {
            record.disarm();
        }
    }
}
