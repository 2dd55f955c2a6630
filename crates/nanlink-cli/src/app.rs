//! Runtime wiring for the CLI
//!
//! Both roles run inside this process over one `Airspace`. One side is
//! driven by the user; the other is an automated peer that starts its role,
//! requests the link as soon as it can and optionally echoes every line.

use std::time::Duration;

use nanlink_core::{
    AppEvent, AppEventReceiver, Command, CommandSender, OrchestratorState, Role, Severity,
};
use nanlink_harness::Airspace;
use nanlink_runtime::{RuntimeBuilder, RuntimeHandle};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CliConfig;
use crate::error::{CliError, Result};

const LOCAL_DEVICE: &str = "local";
const PEER_DEVICE: &str = "peer";

// ----------------------------------------------------------------------------
// Participant
// ----------------------------------------------------------------------------

/// One running orchestrator with its UI-side channels
pub struct Participant {
    pub role: Role,
    pub runtime: RuntimeHandle,
    pub events: AppEventReceiver,
}

impl Participant {
    pub async fn start(
        airspace: &Airspace,
        device: &str,
        role: Role,
        config: &CliConfig,
    ) -> Result<Self> {
        let mut runtime = RuntimeBuilder::new(role)
            .with_config(config.core.clone())
            .with_substrate(airspace.device(device))
            .build_and_start()
            .await?;
        let events = runtime
            .take_app_event_receiver()
            .ok_or_else(|| CliError::Session("App event receiver already taken".to_string()))?;
        Ok(Self {
            role,
            runtime,
            events,
        })
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        Ok(self.runtime.send_command(command).await?)
    }

    pub async fn shutdown(mut self) -> Result<()> {
        Ok(self.runtime.shutdown().await?)
    }
}

/// How the automated peer behaves
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerBehavior {
    /// Answer every received line with `echo: <line>`
    pub echo: bool,
}

/// The local participant plus the automated peer task
pub struct ChatApp {
    pub local: Participant,
    peer: JoinHandle<Result<()>>,
    peer_commands: CommandSender,
}

impl ChatApp {
    /// Start the local role and an automated counterpart
    pub async fn start(config: &CliConfig, role: Role, behavior: PeerBehavior) -> Result<Self> {
        config.validate()?;
        let airspace = Airspace::new();
        airspace.set_peer_address(LOCAL_DEVICE, config.loopback_peer());
        airspace.set_peer_address(PEER_DEVICE, config.loopback_peer());

        let peer_role = match role {
            Role::Advertiser => Role::Discoverer,
            Role::Discoverer => Role::Advertiser,
        };
        let peer = Participant::start(&airspace, PEER_DEVICE, peer_role, config).await?;
        let peer_commands = peer.runtime.command_sender();
        let peer = tokio::spawn(run_automated_peer(peer, config.clone(), behavior));

        let local = Participant::start(&airspace, LOCAL_DEVICE, role, config).await?;
        local.send(Command::Attach).await?;

        info!("Local {} and automated {} started", role, peer_role);
        Ok(Self {
            local,
            peer,
            peer_commands,
        })
    }

    pub async fn stop(self) -> Result<()> {
        self.local.shutdown().await?;
        // A peer that never linked up would otherwise wait forever
        if self.peer_commands.send(Command::Shutdown).await.is_err() {
            debug!("Automated peer already stopped");
        }
        let mut peer = self.peer;
        match tokio::time::timeout(Duration::from_secs(5), &mut peer).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CliError::Session(format!("Peer task failed: {}", e))),
            Err(_) => {
                warn!("Automated peer did not stop in time");
                peer.abort();
                Ok(())
            }
        }
    }
}

/// Drive the non-interactive side: attach, start, link, optionally echo
pub async fn run_automated_peer(
    mut peer: Participant,
    config: CliConfig,
    behavior: PeerBehavior,
) -> Result<()> {
    let descriptor = config.descriptor(peer.role).clone();
    peer.send(Command::Attach).await?;

    let mut streamed = false;
    while let Some(event) = peer.events.recv().await {
        debug!("peer: {:?}", event);
        match event {
            AppEvent::StateChanged { to, .. } => match to {
                OrchestratorState::Attached if !streamed => {
                    peer.send(Command::Start {
                        descriptor: descriptor.clone(),
                    })
                    .await?;
                }
                OrchestratorState::Streaming => streamed = true,
                OrchestratorState::Idle if streamed => break,
                _ => {}
            },
            AppEvent::PeerDiscovered { .. } => peer.send(Command::RequestLink).await?,
            AppEvent::LineReceived { line } if behavior.echo => {
                peer.send(Command::Send {
                    line: format!("echo: {}", line),
                })
                .await?;
            }
            AppEvent::Notification {
                severity: Severity::Error,
                message,
            } => warn!("peer: {}", message),
            _ => {}
        }
    }

    peer.shutdown().await
}

// ----------------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------------

/// Text line for the user, or `None` for events not worth showing
pub fn render(event: &AppEvent) -> Option<String> {
    if let Some(line) = event.transcript() {
        return Some(line);
    }
    match event {
        AppEvent::StateChanged { from, to } => Some(format!("* {} -> {}", from, to)),
        AppEvent::IdentifierReady { address } => Some(format!("* identifier {}", address)),
        AppEvent::PeerDiscovered { peer } => Some(format!("* discovered {}", peer)),
        AppEvent::HandshakeReceived { peer, message } => {
            Some(format!("* handshake '{}' from {}", message, peer))
        }
        AppEvent::LinkEstablished { peer_address } => {
            Some(format!("* link up, peer at {}", peer_address))
        }
        AppEvent::Notification { severity, message } => {
            Some(format!("[{}] {}", severity, message))
        }
        AppEvent::StatusReport(report) => Some(format!("* {}", report)),
        AppEvent::HandshakeStatus { .. }
        | AppEvent::SendFailed { .. }
        | AppEvent::ResourceReleased { .. } => None,
        AppEvent::LineReceived { .. } | AppEvent::LineSent { .. } => None,
    }
}

/// Render as a JSON line or as text
pub fn format_event(event: &AppEvent, json: bool) -> Result<Option<String>> {
    if json {
        return Ok(Some(serde_json::to_string(event)?));
    }
    Ok(render(event))
}
