//! Orchestrator behavior when the radio, the link or the stream fails

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use common::{discovered_pair, free_port, streaming_pair, test_config, Node};
use nanlink_core::{
    AppEvent, AttachError, Command, LinkConfig, LinkState, OrchestratorState, Role,
    ServiceDescriptor, Severity, StartError,
};
use nanlink_harness::Airspace;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_attach_refused() {
    let airspace = Airspace::new();
    airspace.set_attach_refusal(Some(AttachError::PermissionDenied));
    let mut node = Node::start(&airspace, "disc", Role::Discoverer, test_config(free_port())).await;

    node.send(Command::Attach).await;
    node.expect_state(OrchestratorState::Attaching).await;
    node.expect_notification(Severity::Error, "permission").await;
    node.expect_state(OrchestratorState::Idle).await;

    // Nothing was attached, so nothing is detached
    node.send(Command::Close).await;
    node.expect_state(OrchestratorState::Idle).await;
    assert!(airspace.recorder().calls_matching("detach").is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn test_attach_fails_asynchronously() {
    let airspace = Airspace::new();
    airspace.set_attach_failure(Some(AttachError::Unavailable));
    let mut node = Node::start(&airspace, "adv", Role::Advertiser, test_config(free_port())).await;

    node.send(Command::Attach).await;
    node.expect_notification(Severity::Error, "not available").await;
    node.expect_state(OrchestratorState::Idle).await;

    airspace.set_attach_failure(None);
    node.attach().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_start_requires_attach_and_matching_role() {
    let airspace = Airspace::new();
    let mut node = Node::start(&airspace, "adv", Role::Advertiser, test_config(free_port())).await;

    node.send(Command::Start {
        descriptor: ServiceDescriptor::default_publish(),
    })
    .await;
    node.expect_notification(Severity::Warning, &StartError::NotAttached.to_string())
        .await;

    node.attach().await;
    node.send(Command::Start {
        descriptor: ServiceDescriptor::default_subscribe(),
    })
    .await;
    node.expect_notification(Severity::Error, &StartError::RoleMismatch.to_string())
        .await;
    assert_eq!(node.status().await.state, OrchestratorState::Attached);
    node.shutdown().await;
}

#[tokio::test]
async fn test_start_rejected_by_substrate() {
    let airspace = Airspace::new();
    airspace.set_start_rejection(Some(StartError::Rejected {
        reason: "radio busy".to_string(),
    }));
    let mut node = Node::start(&airspace, "disc", Role::Discoverer, test_config(free_port())).await;
    node.attach().await;

    node.send(Command::Start {
        descriptor: ServiceDescriptor::default_subscribe(),
    })
    .await;
    node.expect_notification(Severity::Error, "radio busy").await;
    assert_eq!(node.status().await.state, OrchestratorState::Attached);
    node.shutdown().await;
}

#[tokio::test]
async fn test_link_unavailable_keeps_peer() {
    let airspace = Airspace::new();
    airspace.set_link_unavailable(true);
    let (mut advertiser, mut discoverer) =
        discovered_pair(&airspace, test_config(free_port())).await;

    // The advertiser's own request failed as well and it waits for a new handshake
    advertiser.expect_state(OrchestratorState::RoleStarted).await;
    advertiser
        .expect_notification(Severity::Warning, "Data path not established")
        .await;

    discoverer.send(Command::RequestLink).await;
    discoverer.expect_state(OrchestratorState::LinkPending).await;
    discoverer.expect_state(OrchestratorState::PeerFound).await;
    discoverer
        .expect_notification(Severity::Warning, "Data path not established")
        .await;

    let status = discoverer.status().await;
    assert!(status.peer.is_some());
    assert_eq!(status.link, None);
    assert!(airspace
        .recorder()
        .position("release_link", "disc")
        .is_some());

    advertiser.shutdown().await;
    discoverer.shutdown().await;
}

#[tokio::test]
async fn test_second_link_request_rejected() {
    let airspace = Airspace::new();
    airspace.set_link_silent(true);
    let (advertiser, mut discoverer) = discovered_pair(&airspace, test_config(free_port())).await;

    discoverer.send(Command::RequestLink).await;
    discoverer.expect_state(OrchestratorState::LinkPending).await;
    discoverer.send(Command::RequestLink).await;
    discoverer
        .expect_notification(Severity::Warning, "already outstanding")
        .await;

    let status = discoverer.status().await;
    assert_eq!(status.state, OrchestratorState::LinkPending);
    assert_eq!(status.link, Some(LinkState::Requesting));
    assert_eq!(
        airspace.recorder().calls_matching("request_link").len(),
        2,
        "one request per side"
    );

    advertiser.shutdown().await;
    discoverer.shutdown().await;
}

#[tokio::test]
async fn test_request_link_without_peer() {
    let airspace = Airspace::new();
    let mut node = Node::start(&airspace, "disc", Role::Discoverer, test_config(free_port())).await;
    node.attach().await;

    node.send(Command::RequestLink).await;
    node.expect_notification(Severity::Warning, "No peer").await;
    assert!(airspace.recorder().calls_matching("request_link").is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn test_link_request_times_out() {
    let airspace = Airspace::new();
    airspace.set_link_silent(true);
    let (advertiser, mut discoverer) = discovered_pair(&airspace, test_config(free_port())).await;

    discoverer.send(Command::RequestLink).await;
    discoverer.expect_state(OrchestratorState::LinkPending).await;
    discoverer.expect_state(OrchestratorState::PeerFound).await;
    discoverer
        .expect_notification(Severity::Warning, "Data path not established")
        .await;

    // A fresh request is allowed once the old one is gone
    discoverer.send(Command::RequestLink).await;
    discoverer.expect_state(OrchestratorState::LinkPending).await;

    advertiser.shutdown().await;
    discoverer.shutdown().await;
}

#[tokio::test]
async fn test_link_loss_tears_down_both_sides() {
    let airspace = Airspace::new();
    let (mut advertiser, mut discoverer) =
        streaming_pair(&airspace, test_config(free_port())).await;

    airspace.lose_links("disc");
    discoverer
        .expect_notification(Severity::Warning, "Data path lost")
        .await;
    discoverer.expect_state(OrchestratorState::Idle).await;
    advertiser.expect_state(OrchestratorState::Idle).await;

    discoverer
        .send(Command::Send {
            line: "anyone?".to_string(),
        })
        .await;
    let failed = discoverer
        .expect("send failure", |e| matches!(e, AppEvent::SendFailed { .. }))
        .await;
    assert_eq!(
        failed,
        AppEvent::SendFailed {
            line: "anyone?".to_string(),
            reason: "No stream connection".to_string(),
        }
    );

    advertiser.shutdown().await;
    discoverer.shutdown().await;
}

#[tokio::test]
async fn test_discovery_terminated_before_link() {
    let airspace = Airspace::new();
    let mut node = Node::start(&airspace, "disc", Role::Discoverer, test_config(free_port())).await;
    node.attach().await;
    node.send(Command::Start {
        descriptor: ServiceDescriptor::default_subscribe(),
    })
    .await;
    node.expect_state(OrchestratorState::RoleStarted).await;

    airspace.terminate_discovery("disc");
    node.expect_notification(Severity::Warning, "terminated").await;
    node.expect_state(OrchestratorState::Attached).await;
    assert!(airspace.recorder().calls_matching("close_discovery").is_empty());

    node.send(Command::Start {
        descriptor: ServiceDescriptor::default_subscribe(),
    })
    .await;
    node.expect_state(OrchestratorState::RoleStarted).await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_discovery_terminated_while_streaming() {
    let airspace = Airspace::new();
    let (advertiser, mut discoverer) = streaming_pair(&airspace, test_config(free_port())).await;

    airspace.terminate_discovery("disc");
    discoverer.expect_state(OrchestratorState::Closing).await;
    discoverer.expect_state(OrchestratorState::Idle).await;

    advertiser.shutdown().await;
    discoverer.shutdown().await;
}

#[tokio::test]
async fn test_send_without_stream() {
    let airspace = Airspace::new();
    let mut node = Node::start(&airspace, "disc", Role::Discoverer, test_config(free_port())).await;

    node.send(Command::Send {
        line: "hello".to_string(),
    })
    .await;
    node.expect_notification(Severity::Warning, "Failed to send message: No stream connection")
        .await;
    node.shutdown().await;
}

// ----------------------------------------------------------------------------
// Connect Retries
// ----------------------------------------------------------------------------

/// Discoverer linked to a bare device that never opens a listener itself
async fn linked_discoverer(airspace: &Airspace, config: nanlink_core::NanConfig) -> Node {
    use nanlink_core::{create_event_channel, Event, LinkRequestId, LinkSubstrate, RadioSubstrate};

    let publisher = airspace.device("bare");
    let (sink, mut events) = create_event_channel();
    let session = publisher.attach(sink.clone()).await.unwrap();
    publisher
        .publish(session, &ServiceDescriptor::default_publish(), sink.clone())
        .await
        .unwrap();

    let mut discoverer = Node::start(airspace, "disc", Role::Discoverer, config).await;
    discoverer.attach().await;
    discoverer
        .send(Command::Start {
            descriptor: ServiceDescriptor::default_subscribe(),
        })
        .await;
    discoverer.expect_state(OrchestratorState::PeerFound).await;

    let (handle, peer) = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Event::MessageReceived { handle, peer, .. }) = events.recv().await {
                return (handle, peer);
            }
        }
    })
    .await
    .expect("handshake reaches the bare device");
    publisher
        .request_link(LinkRequestId::new(1), handle, peer, sink)
        .await
        .unwrap();

    discoverer.send(Command::RequestLink).await;
    discoverer.expect_state(OrchestratorState::LinkUp).await;
    discoverer
}

#[tokio::test]
async fn test_connect_retries_until_listener_ready() {
    let airspace = Airspace::new();
    let port = free_port();
    let config = test_config(port).with_link(LinkConfig {
        connect_attempts: 20,
        connect_retry_delay_ms: 25,
        ..LinkConfig::testing()
    });
    let mut discoverer = linked_discoverer(&airspace, config).await;

    let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        .await
        .unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.map(|(socket, _)| socket) });

    discoverer.expect_state(OrchestratorState::Streaming).await;
    let _socket = accept.await.unwrap().unwrap();
    discoverer.shutdown().await;
}

#[tokio::test]
async fn test_connect_gives_up_after_attempts() {
    let airspace = Airspace::new();
    let port = free_port();
    let config = test_config(port).with_link(LinkConfig {
        connect_attempts: 2,
        connect_retry_delay_ms: 10,
        ..LinkConfig::testing()
    });
    let mut discoverer = linked_discoverer(&airspace, config).await;

    discoverer
        .expect_notification(Severity::Error, "Could not connect to peer")
        .await;
    let status = discoverer.status().await;
    assert_eq!(status.state, OrchestratorState::LinkUp);
    assert!(!status.stream_open);

    // Manual retry once something listens
    let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        .await
        .unwrap();
    discoverer.send(Command::RetryConnect).await;
    let (_socket, _) = listener.accept().await.unwrap();
    discoverer.expect_state(OrchestratorState::Streaming).await;
    discoverer.shutdown().await;
}
