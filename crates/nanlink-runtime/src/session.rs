//! Radio session lifecycle
//!
//! Owns the attach/detach lifecycle against the discovery substrate and the
//! device's own discovery identifier once the substrate reports it.

use std::sync::Arc;

use nanlink_core::{AttachError, DiscoveryAddress, EventSender, RadioSubstrate, SessionId};
use tracing::{debug, info, warn};

/// Attach progress of the radio session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Detached,
    Attaching,
    Attached,
    Failed,
}

/// The single radio session an orchestrator may hold
pub struct RadioSession {
    substrate: Arc<dyn RadioSubstrate>,
    status: AttachStatus,
    session: Option<SessionId>,
    identifier: Option<DiscoveryAddress>,
}

impl RadioSession {
    pub fn new(substrate: Arc<dyn RadioSubstrate>) -> Self {
        Self {
            substrate,
            status: AttachStatus::Detached,
            session: None,
            identifier: None,
        }
    }

    pub fn status(&self) -> AttachStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    /// Own discovery identifier, once delivered
    pub fn identifier(&self) -> Option<&DiscoveryAddress> {
        self.identifier.as_ref()
    }

    /// Whether `session` is the one currently held
    pub fn is_current(&self, session: SessionId) -> bool {
        self.session == Some(session)
    }

    /// Ask the substrate to attach. Completion arrives as an event.
    pub async fn attach(&mut self, sink: EventSender) -> Result<SessionId, AttachError> {
        if self.session.is_some() {
            return Err(AttachError::AlreadyAttached);
        }

        match self.substrate.attach(sink).await {
            Ok(session) => {
                debug!("Attach requested as {}", session);
                self.session = Some(session);
                self.identifier = None;
                self.status = AttachStatus::Attaching;
                Ok(session)
            }
            Err(e) => {
                warn!("Discovery substrate refused attach: {}", e);
                self.status = AttachStatus::Failed;
                Err(e)
            }
        }
    }

    /// Attach completion for `session`; false if stale
    pub fn on_attached(&mut self, session: SessionId) -> bool {
        if !self.is_current(session) || self.status != AttachStatus::Attaching {
            return false;
        }
        info!("Radio {} attached", session);
        self.status = AttachStatus::Attached;
        true
    }

    /// Attach failure for `session`; false if stale
    pub fn on_attach_failed(&mut self, session: SessionId, error: &AttachError) -> bool {
        if !self.is_current(session) {
            return false;
        }
        warn!("Radio {} failed to attach: {}", session, error);
        self.session = None;
        self.status = AttachStatus::Failed;
        true
    }

    /// Identifier delivery; false if stale or a repeat of the known value
    pub fn on_identifier(&mut self, session: SessionId, address: DiscoveryAddress) -> bool {
        if !self.is_current(session) {
            return false;
        }
        if self.identifier.as_ref() == Some(&address) {
            return false;
        }
        info!("Own discovery identifier: {}", address);
        self.identifier = Some(address);
        true
    }

    /// Release the session. Safe on a closed or never-attached session.
    pub async fn close(&mut self) -> Option<SessionId> {
        let session = self.session.take()?;
        debug!("Detaching radio {}", session);
        self.substrate.detach(session).await;
        self.status = AttachStatus::Detached;
        self.identifier = None;
        Some(session)
    }
}
