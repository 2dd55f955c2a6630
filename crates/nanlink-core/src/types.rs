//! Core types for nanlink
//!
//! Identifiers handed out by the discovery and link substrates are wrapped in
//! newtypes so that a handle from one substrate object can never be mistaken
//! for another.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// ----------------------------------------------------------------------------
// Substrate Identifiers
// ----------------------------------------------------------------------------

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name($inner);

        impl $name {
            /// Wrap a raw identifier
            pub const fn new(raw: $inner) -> Self {
                Self(raw)
            }

            /// Raw identifier value
            pub const fn value(&self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_newtype!(
    /// An attached radio session
    SessionId(u64),
    "session"
);
id_newtype!(
    /// An active publish or subscribe session
    DiscoveryHandleId(u64),
    "discovery"
);
id_newtype!(
    /// Opaque reference to a remote party, valid only within the discovery
    /// session that produced it
    PeerHandle(u32),
    "peer"
);
id_newtype!(
    /// Correlation id for a discovery-layer message send
    MessageId(u32),
    "msg"
);
id_newtype!(
    /// One outstanding link request
    LinkRequestId(u64),
    "link"
);
id_newtype!(
    /// One stream connection attempt
    StreamId(u64),
    "stream"
);

// ----------------------------------------------------------------------------
// Role
// ----------------------------------------------------------------------------

/// Which side of the discovery protocol an orchestrator plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes a service and reacts to handshakes
    Advertiser,
    /// Subscribes to a service and initiates the handshake
    Discoverer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Advertiser => write!(f, "advertiser"),
            Role::Discoverer => write!(f, "discoverer"),
        }
    }
}

// ----------------------------------------------------------------------------
// Discovery Address
// ----------------------------------------------------------------------------

/// The device's own discovery identifier, delivered once per attach
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryAddress(Vec<u8>);

impl DiscoveryAddress {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lower-case hex without separators
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for DiscoveryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

/// A remote party seen through a discovery session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Substrate handle for the peer
    pub handle: PeerHandle,
    /// Discovery session the handle belongs to
    pub discovery: DiscoveryHandleId,
    /// Decoded service-specific info, if the peer advertised any
    pub info: Option<String>,
}

impl Peer {
    pub fn new(handle: PeerHandle, discovery: DiscoveryHandleId, info: Option<String>) -> Self {
        Self {
            handle,
            discovery,
            info,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.info {
            Some(info) => write!(f, "{} ({}) via {}", self.handle, info, self.discovery),
            None => write!(f, "{} via {}", self.handle, self.discovery),
        }
    }
}

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

/// Progress of the single ephemeral link an orchestrator may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Requesting,
    Available,
    CapabilitiesKnown(IpAddr),
    Unavailable,
    Lost,
}

impl LinkState {
    /// Resolved peer transport address, once known
    pub fn peer_address(&self) -> Option<IpAddr> {
        match self {
            LinkState::CapabilitiesKnown(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Unavailable and Lost end a request for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Unavailable | LinkState::Lost)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Requesting => write!(f, "requesting"),
            LinkState::Available => write!(f, "available"),
            LinkState::CapabilitiesKnown(addr) => write!(f, "capabilities known ({})", addr),
            LinkState::Unavailable => write!(f, "unavailable"),
            LinkState::Lost => write!(f, "lost"),
        }
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_address_display() {
        let addr = DiscoveryAddress::new(vec![0x02, 0x1a, 0xff, 0x00, 0x10, 0x2b]);
        assert_eq!(addr.to_string(), "02:1A:FF:00:10:2B");
        assert_eq!(addr.to_hex(), "021aff00102b");
    }

    #[test]
    fn test_empty_discovery_address() {
        let addr = DiscoveryAddress::new(Vec::new());
        assert_eq!(addr.to_string(), "");
    }

    #[test]
    fn test_id_display() {
        assert_eq!(PeerHandle::new(7).to_string(), "peer#7");
        assert_eq!(LinkRequestId::new(3).to_string(), "link#3");
        assert_eq!(Role::Discoverer.to_string(), "discoverer");
    }

    #[test]
    fn test_peer_display() {
        let peer = Peer::new(
            PeerHandle::new(1),
            DiscoveryHandleId::new(2),
            Some("svc-v1".to_string()),
        );
        assert_eq!(peer.to_string(), "peer#1 (svc-v1) via discovery#2");
    }

    #[test]
    fn test_link_state() {
        let addr: IpAddr = "fe80::1".parse().unwrap();
        let state = LinkState::CapabilitiesKnown(addr);
        assert_eq!(state.peer_address(), Some(addr));
        assert!(!state.is_terminal());
        assert!(LinkState::Lost.is_terminal());
        assert_eq!(LinkState::Requesting.peer_address(), None);
    }

    #[test]
    fn test_timestamp_duration() {
        let a = Timestamp::new(1_000);
        let b = Timestamp::new(3_500);
        assert_eq!(b.duration_since(a).as_millis(), 2_500);
        assert_eq!(a.duration_since(b).as_millis(), 0);
    }
}
