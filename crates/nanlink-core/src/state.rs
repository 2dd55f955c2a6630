//! Orchestrator State Machine
//!
//! The session lifecycle as a linear value: `transition` consumes the current
//! state and either yields the next one with an audit entry or rejects the
//! event. "First event wins" rules are expressed here as guards, so a second
//! handshake or discovery simply has no valid transition.

use crate::types::{Role, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

// ----------------------------------------------------------------------------
// States and Events
// ----------------------------------------------------------------------------

/// Orchestrator lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrchestratorState {
    /// Nothing acquired
    #[default]
    Idle,
    /// Radio attach requested, completion outstanding
    Attaching,
    /// Radio session attached, no role running
    Attached,
    /// Advertise or discover session running
    RoleStarted,
    /// Discoverer tracks its first peer and has sent the handshake
    PeerFound,
    /// One link request outstanding
    LinkPending,
    /// Link has a resolved peer address
    LinkUp,
    /// Stream connection open, lines flowing
    Streaming,
    /// Ordered teardown in progress
    Closing,
}

impl OrchestratorState {
    pub fn state_name(&self) -> &'static str {
        match self {
            OrchestratorState::Idle => "Idle",
            OrchestratorState::Attaching => "Attaching",
            OrchestratorState::Attached => "Attached",
            OrchestratorState::RoleStarted => "RoleStarted",
            OrchestratorState::PeerFound => "PeerFound",
            OrchestratorState::LinkPending => "LinkPending",
            OrchestratorState::LinkUp => "LinkUp",
            OrchestratorState::Streaming => "Streaming",
            OrchestratorState::Closing => "Closing",
        }
    }

    /// Whether a link request or link is held in this state
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            OrchestratorState::LinkPending | OrchestratorState::LinkUp | OrchestratorState::Streaming
        )
    }

    /// Process an event and transition to the next state (consumes self)
    pub fn transition(
        self,
        role: Role,
        event: StateEvent,
    ) -> Result<StateTransition, StateTransitionError> {
        use OrchestratorState::*;

        let new_state = match (self, event) {
            (Idle, StateEvent::AttachRequested) => Attaching,
            (Attaching, StateEvent::AttachSucceeded) => Attached,
            (Attaching, StateEvent::AttachFailed) => Idle,
            (Attached, StateEvent::RoleStarted) => RoleStarted,

            // Advertiser reacts to the first handshake on its own
            (RoleStarted, StateEvent::HandshakeReceived) if role == Role::Advertiser => LinkPending,

            // Discoverer records its first peer, then waits for the caller
            (RoleStarted, StateEvent::PeerDiscovered) if role == Role::Discoverer => PeerFound,
            (PeerFound, StateEvent::LinkRequested) if role == Role::Discoverer => LinkPending,

            (LinkPending, StateEvent::LinkUp) => LinkUp,
            (LinkPending, StateEvent::LinkUnavailable) => match role {
                Role::Advertiser => RoleStarted,
                Role::Discoverer => PeerFound,
            },
            (LinkUp, StateEvent::StreamOpened) => Streaming,

            // Loss of the link or stream always means full teardown
            (LinkPending | LinkUp | Streaming, StateEvent::LinkLost) => Closing,
            (Streaming, StateEvent::ChannelClosed) => Closing,

            (RoleStarted | PeerFound, StateEvent::DiscoveryTerminated) => Attached,
            (LinkPending | LinkUp | Streaming, StateEvent::DiscoveryTerminated) => Closing,

            (_, StateEvent::CloseRequested) => Closing,
            (Closing, StateEvent::TeardownComplete) => Idle,

            (state, event) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state: state.state_name().to_string(),
                    event: event.to_string(),
                    role,
                });
            }
        };

        Ok(StateTransition {
            new_state,
            audit_entry: AuditEntry {
                timestamp: Timestamp::now(),
                role,
                from_state: self.state_name().to_string(),
                to_state: new_state.state_name().to_string(),
                event: event.to_string(),
            },
        })
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Inputs to the state machine, already reduced from raw substrate events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateEvent {
    AttachRequested,
    AttachSucceeded,
    AttachFailed,
    RoleStarted,
    HandshakeReceived,
    PeerDiscovered,
    LinkRequested,
    LinkUp,
    LinkUnavailable,
    StreamOpened,
    LinkLost,
    ChannelClosed,
    DiscoveryTerminated,
    CloseRequested,
    TeardownComplete,
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub new_state: OrchestratorState,
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub role: Role,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// No transition exists for this event in this state
    InvalidTransition {
        from_state: String,
        event: String,
        role: Role,
    },
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransitionError::InvalidTransition {
                from_state,
                event,
                role,
            } => {
                write!(
                    f,
                    "Invalid transition from {} on event {} for {}",
                    from_state, event, role
                )
            }
        }
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(role: Role, events: &[StateEvent]) -> OrchestratorState {
        events.iter().fold(OrchestratorState::Idle, |state, event| {
            state.transition(role, *event).unwrap().new_state
        })
    }

    #[test]
    fn test_initial_state() {
        let state = OrchestratorState::default();
        assert_eq!(state, OrchestratorState::Idle);
        assert!(!state.holds_link());
    }

    #[test]
    fn test_advertiser_flow() {
        let state = drive(
            Role::Advertiser,
            &[
                StateEvent::AttachRequested,
                StateEvent::AttachSucceeded,
                StateEvent::RoleStarted,
                StateEvent::HandshakeReceived,
            ],
        );
        assert_eq!(state, OrchestratorState::LinkPending);

        let transition = state.transition(Role::Advertiser, StateEvent::LinkUp).unwrap();
        assert_eq!(transition.audit_entry.from_state, "LinkPending");
        assert_eq!(transition.audit_entry.to_state, "LinkUp");
        assert_eq!(transition.audit_entry.event, "LinkUp");

        let state = transition
            .new_state
            .transition(Role::Advertiser, StateEvent::StreamOpened)
            .unwrap()
            .new_state;
        assert_eq!(state, OrchestratorState::Streaming);
    }

    #[test]
    fn test_discoverer_flow() {
        let state = drive(
            Role::Discoverer,
            &[
                StateEvent::AttachRequested,
                StateEvent::AttachSucceeded,
                StateEvent::RoleStarted,
                StateEvent::PeerDiscovered,
            ],
        );
        assert_eq!(state, OrchestratorState::PeerFound);

        let state = state
            .transition(Role::Discoverer, StateEvent::LinkRequested)
            .unwrap()
            .new_state;
        assert_eq!(state, OrchestratorState::LinkPending);
        assert!(state.holds_link());
    }

    #[test]
    fn test_role_guards() {
        let started = drive(
            Role::Advertiser,
            &[
                StateEvent::AttachRequested,
                StateEvent::AttachSucceeded,
                StateEvent::RoleStarted,
            ],
        );

        // Only the discoverer tracks peers from service discovery
        assert!(started
            .transition(Role::Advertiser, StateEvent::PeerDiscovered)
            .is_err());
        // Only the advertiser reacts to handshakes
        assert!(started
            .transition(Role::Discoverer, StateEvent::HandshakeReceived)
            .is_err());
    }

    #[test]
    fn test_first_event_wins() {
        let pending = drive(
            Role::Advertiser,
            &[
                StateEvent::AttachRequested,
                StateEvent::AttachSucceeded,
                StateEvent::RoleStarted,
                StateEvent::HandshakeReceived,
            ],
        );
        assert!(pending
            .transition(Role::Advertiser, StateEvent::HandshakeReceived)
            .is_err());

        let found = drive(
            Role::Discoverer,
            &[
                StateEvent::AttachRequested,
                StateEvent::AttachSucceeded,
                StateEvent::RoleStarted,
                StateEvent::PeerDiscovered,
            ],
        );
        assert!(found
            .transition(Role::Discoverer, StateEvent::PeerDiscovered)
            .is_err());
    }

    #[test]
    fn test_unavailable_returns_to_role_state() {
        let advertiser = OrchestratorState::LinkPending
            .transition(Role::Advertiser, StateEvent::LinkUnavailable)
            .unwrap();
        assert_eq!(advertiser.new_state, OrchestratorState::RoleStarted);

        let discoverer = OrchestratorState::LinkPending
            .transition(Role::Discoverer, StateEvent::LinkUnavailable)
            .unwrap();
        assert_eq!(discoverer.new_state, OrchestratorState::PeerFound);
    }

    #[test]
    fn test_attach_failure_returns_to_idle() {
        let state = drive(
            Role::Discoverer,
            &[StateEvent::AttachRequested, StateEvent::AttachFailed],
        );
        assert_eq!(state, OrchestratorState::Idle);
    }

    #[test]
    fn test_loss_leads_to_closing() {
        for state in [
            OrchestratorState::LinkPending,
            OrchestratorState::LinkUp,
            OrchestratorState::Streaming,
        ] {
            let next = state
                .transition(Role::Discoverer, StateEvent::LinkLost)
                .unwrap()
                .new_state;
            assert_eq!(next, OrchestratorState::Closing);
        }

        let next = OrchestratorState::Streaming
            .transition(Role::Advertiser, StateEvent::ChannelClosed)
            .unwrap()
            .new_state;
        assert_eq!(next, OrchestratorState::Closing);
    }

    #[test]
    fn test_discovery_terminated() {
        let next = OrchestratorState::PeerFound
            .transition(Role::Discoverer, StateEvent::DiscoveryTerminated)
            .unwrap()
            .new_state;
        assert_eq!(next, OrchestratorState::Attached);

        let next = OrchestratorState::Streaming
            .transition(Role::Discoverer, StateEvent::DiscoveryTerminated)
            .unwrap()
            .new_state;
        assert_eq!(next, OrchestratorState::Closing);
    }

    #[test]
    fn test_close_from_any_state() {
        let states = [
            OrchestratorState::Idle,
            OrchestratorState::Attaching,
            OrchestratorState::Attached,
            OrchestratorState::RoleStarted,
            OrchestratorState::PeerFound,
            OrchestratorState::LinkPending,
            OrchestratorState::LinkUp,
            OrchestratorState::Streaming,
            OrchestratorState::Closing,
        ];
        for state in states {
            let closing = state
                .transition(Role::Advertiser, StateEvent::CloseRequested)
                .unwrap()
                .new_state;
            assert_eq!(closing, OrchestratorState::Closing);
            let idle = closing
                .transition(Role::Advertiser, StateEvent::TeardownComplete)
                .unwrap()
                .new_state;
            assert_eq!(idle, OrchestratorState::Idle);
        }
    }

    #[test]
    fn test_invalid_transition() {
        let result = OrchestratorState::Idle.transition(Role::Discoverer, StateEvent::StreamOpened);

        match result {
            Err(StateTransitionError::InvalidTransition {
                from_state, event, ..
            }) => {
                assert_eq!(from_state, "Idle");
                assert_eq!(event, "StreamOpened");
            }
            Ok(_) => panic!("Expected InvalidTransition error"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorState::Attached
            .transition(Role::Advertiser, StateEvent::LinkUp)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid transition from Attached on event LinkUp for advertiser"
        );
    }
}
