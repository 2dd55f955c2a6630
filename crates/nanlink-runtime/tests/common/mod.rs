//! Shared helpers for orchestrator integration tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use nanlink_core::{
    AppEvent, AppEventReceiver, Command, NanConfig, OrchestratorState, Role, ServiceDescriptor,
    Severity, StreamConfig,
};
use nanlink_harness::Airspace;
use nanlink_runtime::{RuntimeBuilder, RuntimeHandle};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn free_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Fast timeouts, loopback listener on `port`
pub fn test_config(port: u16) -> NanConfig {
    NanConfig::testing().with_stream(StreamConfig {
        port,
        listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        close_timeout_ms: 500,
    })
}

/// One orchestrator plus the UI side of its channels
pub struct Node {
    pub runtime: RuntimeHandle,
    pub events: AppEventReceiver,
}

impl Node {
    pub async fn start(airspace: &Airspace, name: &str, role: Role, config: NanConfig) -> Self {
        let mut runtime = RuntimeBuilder::new(role)
            .with_config(config)
            .with_substrate(airspace.device(name))
            .build_and_start()
            .await
            .expect("runtime starts");
        let events = runtime.take_app_event_receiver().expect("app events");
        Self { runtime, events }
    }

    pub async fn send(&self, command: Command) {
        self.runtime.send_command(command).await.expect("command sent");
    }

    /// Next app event matching `pred`, skipping everything else
    pub async fn expect<F>(&mut self, what: &str, mut pred: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let found = timeout(WAIT, async {
            while let Some(event) = self.events.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            Ok(None) => panic!("app event channel closed waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }

    pub async fn expect_state(&mut self, state: OrchestratorState) {
        self.expect(&format!("state {}", state), |e| {
            matches!(e, AppEvent::StateChanged { to, .. } if *to == state)
        })
        .await;
    }

    pub async fn expect_notification(&mut self, severity: Severity, needle: &str) -> String {
        let event = self
            .expect(&format!("{} notification '{}'", severity, needle), |e| {
                matches!(e, AppEvent::Notification { severity: s, message }
                    if *s == severity && message.contains(needle))
            })
            .await;
        match event {
            AppEvent::Notification { message, .. } => message,
            _ => unreachable!(),
        }
    }

    /// Everything queued right now, without waiting
    pub fn drain(&mut self) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn status(&mut self) -> nanlink_core::StatusReport {
        self.send(Command::GetStatus).await;
        match self
            .expect("status report", |e| matches!(e, AppEvent::StatusReport(_)))
            .await
        {
            AppEvent::StatusReport(report) => report,
            _ => unreachable!(),
        }
    }

    pub async fn attach(&mut self) {
        self.send(Command::Attach).await;
        self.expect_state(OrchestratorState::Attached).await;
    }

    pub async fn shutdown(mut self) {
        self.runtime.shutdown().await.expect("clean shutdown");
    }
}

/// An advertiser in `RoleStarted` and a discoverer that has found it and
/// sent the handshake
pub async fn discovered_pair(airspace: &Airspace, config: NanConfig) -> (Node, Node) {
    let mut advertiser = Node::start(airspace, "adv", Role::Advertiser, config.clone()).await;
    advertiser.attach().await;
    advertiser
        .send(Command::Start {
            descriptor: ServiceDescriptor::default_publish(),
        })
        .await;
    advertiser.expect_state(OrchestratorState::RoleStarted).await;

    let mut discoverer = Node::start(airspace, "disc", Role::Discoverer, config).await;
    discoverer.attach().await;
    discoverer
        .send(Command::Start {
            descriptor: ServiceDescriptor::default_subscribe(),
        })
        .await;
    discoverer.expect_state(OrchestratorState::PeerFound).await;

    advertiser
        .expect("handshake", |e| matches!(e, AppEvent::HandshakeReceived { .. }))
        .await;
    advertiser.expect_state(OrchestratorState::LinkPending).await;

    (advertiser, discoverer)
}

/// Both sides in `Streaming`
pub async fn streaming_pair(airspace: &Airspace, config: NanConfig) -> (Node, Node) {
    let (mut advertiser, mut discoverer) = discovered_pair(airspace, config).await;
    discoverer.send(Command::RequestLink).await;
    discoverer.expect_state(OrchestratorState::LinkPending).await;

    advertiser.expect_state(OrchestratorState::Streaming).await;
    discoverer.expect_state(OrchestratorState::Streaming).await;
    (advertiser, discoverer)
}
