//! nanlink CLI Configuration
//!
//! Layered loading with priority: command line > environment > file >
//! defaults. Environment overrides use the `NANLINK_` prefix.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use nanlink_core::{NanConfig, Role, ServiceDescriptor};

use crate::error::{CliError, Result};

pub const ENV_SERVICE_NAME: &str = "NANLINK_SERVICE_NAME";
pub const ENV_PORT: &str = "NANLINK_PORT";

/// Complete configuration for the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Runtime configuration shared by both roles
    #[serde(default)]
    pub core: NanConfig,

    /// What the advertiser announces
    #[serde(default = "ServiceDescriptor::default_publish")]
    pub publish: ServiceDescriptor,

    /// What the discoverer looks for
    #[serde(default = "ServiceDescriptor::default_subscribe")]
    pub subscribe: ServiceDescriptor,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            core: NanConfig::default(),
            publish: ServiceDescriptor::default_publish(),
            subscribe: ServiceDescriptor::default_subscribe(),
        }
    }
}

impl CliConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `NANLINK_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(ENV_SERVICE_NAME) {
            self.set_service_name(&name);
        }
        if let Some(port) = lookup(ENV_PORT) {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|e| CliError::Config(format!("{} '{}': {}", ENV_PORT, port, e)))?;
            self.core.stream.port = port;
        }
        Ok(())
    }

    /// Apply command-line overrides
    pub fn apply_flags(&mut self, port: Option<u16>, service: Option<&str>) {
        if let Some(port) = port {
            self.core.stream.port = port;
        }
        if let Some(service) = service {
            self.set_service_name(service);
        }
    }

    fn set_service_name(&mut self, name: &str) {
        self.publish.service_name = name.to_string();
        self.subscribe.service_name = name.to_string();
    }

    pub fn descriptor(&self, role: Role) -> &ServiceDescriptor {
        match role {
            Role::Advertiser => &self.publish,
            Role::Discoverer => &self.subscribe,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        self.publish
            .validate_for(Role::Advertiser)
            .map_err(|e| CliError::Config(format!("publish: {}", e)))?;
        self.subscribe
            .validate_for(Role::Discoverer)
            .map_err(|e| CliError::Config(format!("subscribe: {}", e)))?;
        if self.publish.service_name != self.subscribe.service_name {
            return Err(CliError::Config(format!(
                "publish '{}' and subscribe '{}' name different services",
                self.publish.service_name, self.subscribe.service_name
            )));
        }
        Ok(())
    }

    /// Address the discoverer dials to reach a listener bound on
    /// `core.stream.listen_address` in this process
    pub fn loopback_peer(&self) -> IpAddr {
        match self.core.stream.listen_address {
            IpAddr::V6(addr) if addr.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(addr) if addr.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            addr => addr,
        }
    }

    /// Example configuration file contents
    pub fn example_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }
}
