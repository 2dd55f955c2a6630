//! Centralized Configuration Management
//!
//! Runtime tuning (`NanConfig`) and the service descriptor handed to the
//! advertise and discover roles. Durations are stored as milliseconds so the
//! structures stay readable when loaded from TOML.

use crate::errors::{NanError, NanResult, StartError};
use crate::types::Role;
use core::time::Duration;
use std::net::{IpAddr, Ipv6Addr};

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the bounded channels around the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffer size for Command channels (UI → Orchestrator)
    pub command_buffer_size: usize,
    /// Buffer size for AppEvent channels (Orchestrator → UI)
    pub app_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32,    // UI commands are infrequent
            app_event_buffer_size: 256, // Chat lines can arrive in bursts
        }
    }
}

impl ChannelConfig {
    /// Small buffers for tests
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 8,
            app_event_buffer_size: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Link Configuration
// ----------------------------------------------------------------------------

/// Link negotiation and connect-retry tuning
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a link request may stay unanswered before it counts as unavailable
    pub request_timeout_ms: u64,
    /// Outbound connect attempts made by the orchestrator before giving up
    pub connect_attempts: u32,
    /// Delay between outbound connect attempts
    pub connect_retry_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_attempts: 5,
            connect_retry_delay_ms: 250,
        }
    }
}

impl LinkConfig {
    pub fn testing() -> Self {
        Self {
            request_timeout_ms: 500,
            connect_attempts: 3,
            connect_retry_delay_ms: 20,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

// ----------------------------------------------------------------------------
// Stream Configuration
// ----------------------------------------------------------------------------

/// Stream socket parameters shared by both sides of a link
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Well-known port both peers agree on
    pub port: u16,
    /// Local address the listener binds
    pub listen_address: IpAddr,
    /// Upper bound on waiting for the read loop to exit during close
    pub close_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            listen_address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            close_timeout_ms: 2_000,
        }
    }
}

impl StreamConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Handshake Configuration
// ----------------------------------------------------------------------------

/// Discovery-layer handshake sent by the discoverer to the first peer it finds
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub token: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            token: "request_ndp".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Runtime configuration for one orchestrator instance
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NanConfig {
    /// Channel buffer configuration
    pub channels: ChannelConfig,
    /// Link negotiation configuration
    pub link: LinkConfig,
    /// Stream socket configuration
    pub stream: StreamConfig,
    /// Handshake token configuration
    pub handshake: HandshakeConfig,
}

impl NanConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with short timeouts for tests
    pub fn testing() -> Self {
        Self {
            channels: ChannelConfig::testing(),
            link: LinkConfig::testing(),
            stream: StreamConfig {
                close_timeout_ms: 500,
                ..StreamConfig::default()
            },
            handshake: HandshakeConfig::default(),
        }
    }

    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Override only the well-known stream port
    pub fn with_port(mut self, port: u16) -> Self {
        self.stream.port = port;
        self
    }

    pub fn with_handshake_token<T: Into<String>>(mut self, token: T) -> Self {
        self.handshake.token = token.into();
        self
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> NanResult<()> {
        if self.channels.command_buffer_size == 0 {
            return Err(NanError::config_error("Command buffer size cannot be zero"));
        }
        if self.channels.app_event_buffer_size == 0 {
            return Err(NanError::config_error(
                "App event buffer size cannot be zero",
            ));
        }
        if self.link.request_timeout_ms == 0 {
            return Err(NanError::config_error("Link request timeout cannot be zero"));
        }
        if self.link.connect_attempts == 0 {
            return Err(NanError::config_error("Connect attempts cannot be zero"));
        }
        if self.stream.port == 0 {
            return Err(NanError::config_error(
                "Stream port must be fixed and known to both peers",
            ));
        }
        if self.handshake.token.trim().is_empty() {
            return Err(NanError::config_error("Handshake token cannot be empty"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Service Descriptor
// ----------------------------------------------------------------------------

/// How an advertiser announces its service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishType {
    /// Broadcast the service without waiting to be asked
    #[default]
    Unsolicited,
    /// Only answer active subscribers
    Solicited,
}

/// How a discoverer scans for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeType {
    /// Listen for unsolicited announcements
    #[default]
    Passive,
    /// Send queries that solicited publishers answer
    Active,
}

/// Immutable configuration used to advertise or scan for a named service.
/// The core passes payload and filter through to the substrate unmodified.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceDescriptor {
    pub role: Role,
    pub service_name: String,
    /// Service-specific info (advertiser only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_info: Option<String>,
    /// Match filter (discoverer only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_filter: Option<String>,
    #[serde(default)]
    pub publish_type: PublishType,
    #[serde(default)]
    pub subscribe_type: SubscribeType,
}

impl ServiceDescriptor {
    pub const DEFAULT_SERVICE_NAME: &'static str = "com.example.test";

    /// Descriptor for the advertise role
    pub fn publish<T: Into<String>>(service_name: T) -> Self {
        Self {
            role: Role::Advertiser,
            service_name: service_name.into(),
            service_info: None,
            match_filter: None,
            publish_type: PublishType::default(),
            subscribe_type: SubscribeType::default(),
        }
    }

    /// Descriptor for the discover role
    pub fn subscribe<T: Into<String>>(service_name: T) -> Self {
        Self {
            role: Role::Discoverer,
            ..Self::publish(service_name)
        }
    }

    /// Advertiser defaults used by the demo
    pub fn default_publish() -> Self {
        Self::publish(Self::DEFAULT_SERVICE_NAME).with_service_info("Test_Info")
    }

    /// Discoverer defaults used by the demo
    pub fn default_subscribe() -> Self {
        Self::subscribe(Self::DEFAULT_SERVICE_NAME).with_match_filter("Test_Filter")
    }

    pub fn with_service_info<T: Into<String>>(mut self, info: T) -> Self {
        self.service_info = Some(info.into());
        self
    }

    pub fn with_match_filter<T: Into<String>>(mut self, filter: T) -> Self {
        self.match_filter = Some(filter.into());
        self
    }

    pub fn with_publish_type(mut self, publish_type: PublishType) -> Self {
        self.publish_type = publish_type;
        self
    }

    pub fn with_subscribe_type(mut self, subscribe_type: SubscribeType) -> Self {
        self.subscribe_type = subscribe_type;
        self
    }

    pub fn with_service_name<T: Into<String>>(mut self, service_name: T) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Opaque service-info payload as sent over the air
    pub fn service_info_bytes(&self) -> Vec<u8> {
        self.service_info
            .as_deref()
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default()
    }

    /// Check that the descriptor is usable for `role`
    pub fn validate_for(&self, role: Role) -> Result<(), StartError> {
        if self.role != role {
            return Err(StartError::RoleMismatch);
        }
        if self.service_name.trim().is_empty() {
            return Err(StartError::InvalidDescriptor {
                reason: "service name is empty".to_string(),
            });
        }
        match self.role {
            Role::Advertiser if self.match_filter.is_some() => Err(StartError::InvalidDescriptor {
                reason: "match filter is only valid for the discover role".to_string(),
            }),
            Role::Discoverer if self.service_info.is_some() => Err(StartError::InvalidDescriptor {
                reason: "service info is only valid for the advertise role".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NanConfig::default();
        assert_eq!(config.channels.command_buffer_size, 32);
        assert_eq!(config.link.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.stream.port, 8888);
        assert_eq!(config.handshake.token, "request_ndp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let config = NanConfig::default().with_port(0);
        assert!(matches!(
            config.validate(),
            Err(NanError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_blank_token() {
        let config = NanConfig::default().with_handshake_token("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptor_defaults() {
        let publish = ServiceDescriptor::default_publish();
        assert_eq!(publish.service_name, "com.example.test");
        assert_eq!(publish.service_info_bytes(), b"Test_Info".to_vec());
        assert_eq!(publish.publish_type, PublishType::Unsolicited);
        assert!(publish.validate_for(Role::Advertiser).is_ok());

        let subscribe = ServiceDescriptor::default_subscribe();
        assert_eq!(subscribe.match_filter.as_deref(), Some("Test_Filter"));
        assert!(subscribe.validate_for(Role::Discoverer).is_ok());
    }

    #[test]
    fn test_descriptor_validation() {
        let empty = ServiceDescriptor::publish("  ");
        assert!(matches!(
            empty.validate_for(Role::Advertiser),
            Err(StartError::InvalidDescriptor { .. })
        ));

        let publish = ServiceDescriptor::default_publish();
        assert_eq!(
            publish.validate_for(Role::Discoverer),
            Err(StartError::RoleMismatch)
        );

        let bad = ServiceDescriptor::subscribe("svc").with_service_info("payload");
        assert!(bad.validate_for(Role::Discoverer).is_err());
    }

    #[test]
    fn test_config_json_roundtrip_with_partial_input() {
        let config: NanConfig =
            serde_json::from_str(r#"{"stream": {"port": 9000}}"#).unwrap();
        assert_eq!(config.stream.port, 9000);
        assert_eq!(config.link, LinkConfig::default());
    }
}
