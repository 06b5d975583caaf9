//! Session-level behavior against the loopback broker: subscription
//! lifecycle, malformed payloads, reconnects, and phase deadlines.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use cxr_core::clock::MessageClock;
use cxr_core::message::{GetTrajectoryResult, WirePayload};
use cxr_session::machine::{Notice, Phase};
use cxr_session::{Deadlines, Session, SessionConfig, SessionEvent, State};
use cxr_testing::{MemoryBroker, MemoryTransport};

fn config(device_id: &str, project: &str) -> SessionConfig {
    SessionConfig {
        device_id: device_id.to_owned(),
        project_name: project.to_owned(),
        ..SessionConfig::default()
    }
}

async fn spawn_device(
    broker: &MemoryBroker,
    config: SessionConfig,
) -> (Session<MemoryTransport>, UnboundedReceiver<SessionEvent>) {
    let (transport, deliveries) = broker.attach(&config.device_id);
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

async fn next_protocol_event(events: &mut UnboundedReceiver<SessionEvent>) -> Notice {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed");
        if let SessionEvent::Protocol(notice) = event {
            return notice;
        }
    }
}

#[tokio::test]
async fn connect_takes_exactly_the_base_subscriptions() {
    let broker = MemoryBroker::new();
    let (_session, mut events) = spawn_device(&broker, config("device-a", "site")).await;

    let subs = broker.subscriptions_of("device-a");
    assert_eq!(subs.len(), 3);
    assert!(subs.contains("compas_xr/get_trajectory_result/site"));
    assert!(subs.contains("compas_xr/approve_trajectory/site"));
    assert!(subs.contains("compas_xr/approval_counter_request/site"));
    // The scoped topic stays unsubscribed until the device turns primary.
    assert!(!subs.contains("compas_xr/approval_counter_result/site"));

    let first = events.recv().await.expect("event");
    assert_eq!(first, SessionEvent::Connected);
}

#[tokio::test]
async fn counter_result_subscription_is_scoped_to_the_primary_phase() {
    let broker = MemoryBroker::new();
    let (session, _events) = spawn_device(&broker, config("device-a", "site")).await;
    let scoped = "compas_xr/approval_counter_result/site";

    session
        .request_trajectory("12", true)
        .await
        .expect("request");
    assert!(!broker.subscriptions_of("device-a").contains(scoped));

    let clock = MessageClock::new();
    let result = GetTrajectoryResult::new(&clock, "planner", "12", vec![vec![1.0]]);
    broker.publish_external(
        "compas_xr/get_trajectory_result/site",
        result.encode().expect("encode"),
    );
    wait_for_state(&session, State::AwaitingApprovals).await;
    assert!(broker.subscriptions_of("device-a").contains(scoped));

    // Rejection is one of the exits that must release the subscription.
    session.reject().await.expect("reject");
    wait_for_state(&session, State::Idle).await;
    assert!(!broker.subscriptions_of("device-a").contains(scoped));
}

#[tokio::test]
async fn malformed_payloads_are_dropped_without_state_change() {
    let broker = MemoryBroker::new();
    let (session, _events) = spawn_device(&broker, config("device-a", "site")).await;

    broker.publish_external(
        "compas_xr/approve_trajectory/site",
        b"{definitely not json".to_vec(),
    );
    broker.publish_external("compas_xr/get_trajectory_result/site", Vec::new());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(session.state().await, State::Idle);
    // The session still works afterwards.
    session
        .request_trajectory("12", true)
        .await
        .expect("request");
    assert_eq!(session.state().await, State::AwaitingTrajectory);
}

#[tokio::test]
async fn unknown_approval_status_is_dropped() {
    let broker = MemoryBroker::new();
    let (session, _events) = spawn_device(&broker, config("device-a", "site")).await;

    // Craft an approval with a status outside the closed set.
    let clock = MessageClock::new();
    let mut approval = cxr_core::message::ApproveTrajectory::new(
        &clock,
        "peer-x",
        "12",
        vec![vec![1.0]],
        cxr_core::ApprovalStatus::Rejected,
    );
    approval.approval_status = 7;
    broker.publish_external(
        "compas_xr/approve_trajectory/site",
        approval.encode().expect("encode"),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.state().await, State::Idle);
}

#[tokio::test]
async fn reconnect_with_a_new_project_rederives_the_topic_set() {
    let broker = MemoryBroker::new();
    let (session, _events) = spawn_device(&broker, config("device-a", "site")).await;

    session
        .request_trajectory("12", true)
        .await
        .expect("request");
    session.reconnect(Some("bridge")).await.expect("reconnect");

    // The primary role did not survive the connection gap.
    assert_eq!(session.state().await, State::Idle);
    let subs = broker.subscriptions_of("device-a");
    assert!(subs.contains("compas_xr/approve_trajectory/bridge"));
    assert!(!subs.contains("compas_xr/approve_trajectory/site"));
}

#[tokio::test]
async fn trajectory_deadline_expiry_aborts_and_notifies() {
    let broker = MemoryBroker::new();
    let mut cfg = config("device-a", "site");
    cfg.deadlines = Deadlines {
        trajectory_secs: 0,
        ..Deadlines::default()
    };
    let (session, mut events) = spawn_device(&broker, cfg).await;

    session
        .request_trajectory("12", true)
        .await
        .expect("request");
    wait_for_state(&session, State::Idle).await;

    let mut saw_timeout = false;
    let mut saw_closed = false;
    for _ in 0..4 {
        match next_protocol_event(&mut events).await {
            Notice::TimedOut { phase } => {
                assert_eq!(phase, Phase::AwaitingTrajectory);
                saw_timeout = true;
            }
            Notice::TransactionClosed => saw_closed = true,
            _ => {}
        }
        if saw_timeout && saw_closed {
            break;
        }
    }
    assert!(saw_timeout && saw_closed);
}

#[tokio::test]
async fn deadlines_rearm_for_the_next_transaction() {
    let broker = MemoryBroker::new();
    let mut cfg = config("device-a", "site");
    cfg.deadlines = Deadlines {
        trajectory_secs: 0,
        ..Deadlines::default()
    };
    let (session, mut events) = spawn_device(&broker, cfg).await;

    // First transaction times out immediately.
    session
        .request_trajectory("12", true)
        .await
        .expect("request");
    wait_for_state(&session, State::Idle).await;
    loop {
        if let Notice::TimedOut { .. } = next_protocol_event(&mut events).await {
            break;
        }
    }

    // An expired firing from the previous round must not disarm the
    // deadline of the transaction opened after it.
    session
        .request_trajectory("13", true)
        .await
        .expect("request after expiry");
    wait_for_state(&session, State::Idle).await;
    loop {
        if let Notice::TimedOut { phase } = next_protocol_event(&mut events).await {
            assert_eq!(phase, Phase::AwaitingTrajectory);
            break;
        }
    }
}
