//! Runtime Builder API
//!
//! Builder-style API for consumers (CLI/tests) to wire substrates into an
//! orchestrator and get command/app-event handles back.

use std::sync::Arc;
use std::time::Duration;

use nanlink_core::{
    create_app_event_channel, create_command_channel, create_event_channel, AppEventReceiver,
    Command, CommandSender, LinkSubstrate, NanConfig, NanError, NanResult, RadioSubstrate, Role,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::orchestrator::SessionOrchestrator;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for one orchestrator running in its own task
pub struct RuntimeBuilder {
    role: Role,
    config: NanConfig,
    radio: Option<Arc<dyn RadioSubstrate>>,
    link: Option<Arc<dyn LinkSubstrate>>,
}

impl RuntimeBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: NanConfig::default(),
            radio: None,
            link: None,
        }
    }

    pub fn with_config(mut self, config: NanConfig) -> Self {
        self.config = config;
        self
    }

    /// Discovery substrate used for attach, publish/subscribe and messages
    pub fn with_radio(mut self, radio: Arc<dyn RadioSubstrate>) -> Self {
        self.radio = Some(radio);
        self
    }

    /// Link substrate used for data-path requests
    pub fn with_link(mut self, link: Arc<dyn LinkSubstrate>) -> Self {
        self.link = Some(link);
        self
    }

    /// Use one object for both substrate roles
    pub fn with_substrate<S>(self, substrate: Arc<S>) -> Self
    where
        S: RadioSubstrate + LinkSubstrate + 'static,
    {
        self.with_radio(substrate.clone()).with_link(substrate)
    }

    /// Build the orchestrator and spawn its loop
    pub async fn build_and_start(self) -> NanResult<RuntimeHandle> {
        self.config.validate()?;
        let radio = self
            .radio
            .ok_or_else(|| NanError::config_error("No radio substrate configured"))?;
        let link = self
            .link
            .ok_or_else(|| NanError::config_error("No link substrate configured"))?;

        info!("Building nanlink runtime as {}", self.role);

        let (command_sender, command_receiver) = create_command_channel(&self.config.channels);
        let (app_event_sender, app_event_receiver) =
            create_app_event_channel(&self.config.channels);
        let (event_sender, event_receiver) = create_event_channel();

        let orchestrator = SessionOrchestrator::new(
            self.role,
            self.config,
            radio,
            link,
            command_receiver,
            event_sender,
            event_receiver,
            app_event_sender,
        );
        let orchestrator_handle = tokio::spawn(orchestrator.run());

        info!("nanlink runtime started");

        Ok(RuntimeHandle {
            role: self.role,
            command_sender,
            app_event_receiver: Some(app_event_receiver),
            orchestrator_handle: Some(orchestrator_handle),
            running: true,
        })
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a running orchestrator
pub struct RuntimeHandle {
    role: Role,
    command_sender: CommandSender,
    app_event_receiver: Option<AppEventReceiver>,
    orchestrator_handle: Option<JoinHandle<NanResult<()>>>,
    running: bool,
}

impl RuntimeHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn command_sender(&self) -> CommandSender {
        self.command_sender.clone()
    }

    /// Take the app event receiver (can only be called once)
    pub fn take_app_event_receiver(&mut self) -> Option<AppEventReceiver> {
        self.app_event_receiver.take()
    }

    pub async fn send_command(&self, command: Command) -> NanResult<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| NanError::channel_error("Failed to send command to runtime"))
    }

    pub fn is_running(&self) -> bool {
        self.running
            && self
                .orchestrator_handle
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the orchestrator loop to finish
    pub async fn wait(&mut self) -> NanResult<()> {
        let Some(handle) = self.orchestrator_handle.take() else {
            return Ok(());
        };
        self.running = false;
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(NanError::channel_error(format!(
                "Orchestrator task panicked: {}",
                e
            ))),
        }
    }

    /// Ask the orchestrator to release everything and stop
    pub async fn shutdown(&mut self) -> NanResult<()> {
        info!("Shutting down nanlink runtime");
        let _ = self.send_command(Command::Shutdown).await;

        if let Some(handle) = self.orchestrator_handle.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                return Err(NanError::channel_error(
                    "Orchestrator did not stop within the shutdown timeout",
                ));
            }
        }

        self.running = false;
        info!("nanlink runtime shut down");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Convenience Functions
// ----------------------------------------------------------------------------

/// Runtime over a combined substrate with the fast test configuration
pub async fn create_test_runtime<S>(role: Role, substrate: Arc<S>) -> NanResult<RuntimeHandle>
where
    S: RadioSubstrate + LinkSubstrate + 'static,
{
    RuntimeBuilder::new(role)
        .with_config(NanConfig::testing())
        .with_substrate(substrate)
        .build_and_start()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanlink_core::{AppEvent, OrchestratorState};
    use nanlink_harness::Airspace;

    #[tokio::test]
    async fn test_runtime_builder() {
        let airspace = Airspace::new();
        let mut runtime = RuntimeBuilder::new(Role::Advertiser)
            .with_config(NanConfig::testing())
            .with_substrate(airspace.device("a"))
            .build_and_start()
            .await
            .expect("Failed to build runtime");

        assert_eq!(runtime.role(), Role::Advertiser);
        assert!(runtime.is_running());

        runtime
            .send_command(Command::GetStatus)
            .await
            .expect("Failed to send command");

        runtime.shutdown().await.expect("Failed to shutdown");
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn test_missing_substrate_rejected() {
        let airspace = Airspace::new();
        let result = RuntimeBuilder::new(Role::Discoverer)
            .with_radio(airspace.device("a"))
            .build_and_start()
            .await;
        assert!(matches!(result, Err(NanError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let airspace = Airspace::new();
        let result = RuntimeBuilder::new(Role::Discoverer)
            .with_config(NanConfig::testing().with_port(0))
            .with_substrate(airspace.device("a"))
            .build_and_start()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_app_event_receiver() {
        let airspace = Airspace::new();
        let mut runtime = create_test_runtime(Role::Discoverer, airspace.device("a"))
            .await
            .expect("Failed to create runtime");

        let mut app_events = runtime
            .take_app_event_receiver()
            .expect("Failed to get app event receiver");
        assert!(runtime.take_app_event_receiver().is_none());

        runtime
            .send_command(Command::GetStatus)
            .await
            .expect("Failed to send command");

        let event = tokio::time::timeout(Duration::from_secs(2), app_events.recv())
            .await
            .expect("status report in time");
        match event {
            Some(AppEvent::StatusReport(report)) => {
                assert_eq!(report.role, Role::Discoverer);
                assert_eq!(report.state, OrchestratorState::Idle);
            }
            other => panic!("unexpected app event: {:?}", other),
        }

        runtime.shutdown().await.expect("Failed to shutdown");
    }
}
