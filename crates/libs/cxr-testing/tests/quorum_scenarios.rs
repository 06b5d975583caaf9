//! Multi-device consensus rounds over the loopback broker.
//!
//! The loopback means every device also hears its own publishes, so the
//! primary counts itself both as a present peer and as an approver —
//! exactly what a real MQTT broker does.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use cxr_core::clock::MessageClock;
use cxr_core::message::{GetTrajectoryResult, Trajectory, WirePayload};
use cxr_session::{Session, SessionConfig, SessionEvent, State};
use cxr_testing::{MemoryBroker, MemoryTransport};

const PROJECT: &str = "pavilion";

fn trajectory() -> Trajectory {
    vec![vec![0.0, 1.2, -0.5], vec![0.1, 1.3, -0.4]]
}

async fn device(
    broker: &MemoryBroker,
    device_id: &str,
) -> (Session<MemoryTransport>, UnboundedReceiver<SessionEvent>) {
    let (transport, deliveries) = broker.attach(device_id);
    let config = SessionConfig {
        device_id: device_id.to_owned(),
        project_name: PROJECT.to_owned(),
        ..SessionConfig::default()
    };
    let (session, events) = Session::new(transport, config);
    session.connect().await.expect("connect");
    let runner = session.clone();
    tokio::spawn(async move { runner.run(deliveries).await });
    (session, events)
}

async fn wait_for_state(session: &Session<MemoryTransport>, want: State) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if session.state().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state {want:?} not reached"));
}

async fn wait_for_present(session: &Session<MemoryTransport>, want: u32) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (_, present) = session.progress().await;
            if present >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("presence count {want} not reached"));
}

fn planner_replies(broker: &MemoryBroker, element_id: &str, trajectory: Trajectory) {
    let clock = MessageClock::new();
    let result = GetTrajectoryResult::new(&clock, "planner", element_id, trajectory);
    broker.publish_external(
        &format!("compas_xr/get_trajectory_result/{PROJECT}"),
        result.encode().expect("encode"),
    );
}

#[tokio::test]
async fn full_round_reaches_quorum_and_consensus() {
    let broker = MemoryBroker::new();
    let (primary, _primary_events) = device(&broker, "device-p").await;
    let (peer_a, _ea) = device(&broker, "peer-a").await;
    let (peer_b, _eb) = device(&broker, "peer-b").await;
    let (peer_c, _ec) = device(&broker, "peer-c").await;

    primary
        .request_trajectory("12", true)
        .await
        .expect("request");
    assert_eq!(primary.state().await, State::AwaitingTrajectory);

    planner_replies(&broker, "12", trajectory());
    wait_for_state(&primary, State::AwaitingApprovals).await;
    for peer in [&peer_a, &peer_b, &peer_c] {
        wait_for_state(peer, State::ReviewingAsNonPrimary).await;
    }

    // Four devices are listening; all four answer the probe, the primary
    // included via loopback.
    wait_for_present(&primary, 4).await;

    for peer in [&peer_a, &peer_b, &peer_c] {
        peer.approve().await.expect("approve");
    }
    primary.approve().await.expect("approve");
    wait_for_state(&primary, State::ReadyToExecute).await;

    // The scoped counter-result subscription was released at quorum.
    let counter_result_topic = format!("compas_xr/approval_counter_result/{PROJECT}");
    assert!(!broker
        .subscriptions_of("device-p")
        .contains(&counter_result_topic));

    primary.execute().await.expect("execute");
    wait_for_state(&primary, State::Idle).await;
    for peer in [&peer_a, &peer_b, &peer_c] {
        wait_for_state(peer, State::Idle).await;
    }
    let (approved, present) = primary.progress().await;
    assert_eq!((approved, present), (0, 0));
}

#[tokio::test]
async fn a_single_rejection_resets_every_device() {
    let broker = MemoryBroker::new();
    let (primary, _pe) = device(&broker, "device-p").await;
    let (peer_a, _ea) = device(&broker, "peer-a").await;
    let (peer_b, _eb) = device(&broker, "peer-b").await;

    primary
        .request_trajectory("31", true)
        .await
        .expect("request");
    planner_replies(&broker, "31", trajectory());
    wait_for_state(&primary, State::AwaitingApprovals).await;
    wait_for_state(&peer_a, State::ReviewingAsNonPrimary).await;
    wait_for_state(&peer_b, State::ReviewingAsNonPrimary).await;

    peer_b.reject().await.expect("reject");

    wait_for_state(&primary, State::Idle).await;
    wait_for_state(&peer_a, State::Idle).await;
    wait_for_state(&peer_b, State::Idle).await;
    assert_eq!(primary.progress().await, (0, 0));

    // The group is free for the next transaction.
    primary
        .request_trajectory("32", true)
        .await
        .expect("request after reset");
}

#[tokio::test]
async fn empty_planner_reply_frees_the_requester() {
    let broker = MemoryBroker::new();
    let (primary, _pe) = device(&broker, "device-p").await;
    let (peer_a, _ea) = device(&broker, "peer-a").await;

    primary
        .request_trajectory("40", true)
        .await
        .expect("request");
    planner_replies(&broker, "40", Vec::new());

    wait_for_state(&primary, State::Idle).await;
    // No probe went out, so the peer saw nothing worth reviewing.
    assert_eq!(peer_a.state().await, State::Idle);
    assert_eq!(primary.progress().await, (0, 0));
}

#[tokio::test]
async fn non_robot_steps_never_open_a_transaction() {
    let broker = MemoryBroker::new();
    let (primary, _pe) = device(&broker, "device-p").await;
    let err = primary.request_trajectory("50", false).await.unwrap_err();
    assert!(err.to_string().contains("robot"));
    assert_eq!(primary.state().await, State::Idle);
}
