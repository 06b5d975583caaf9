//! Approval state machine.
//!
//! Pure per-device coordinator: consumes operator actions and inbound
//! messages, returns the boundary side effects (publishes, subscription
//! changes, deadlines, notifications) as data for the caller to execute.
//! Keeping the transport out of the machine keeps every transition testable
//! in isolation.
//!
//! Note on operator reject: the machine only publishes the rejection. The
//! local abort rides the broadcast loopback — every device, the rejecting
//! one included, subscribes to the approve-trajectory topic and tears the
//! transaction down in the inbound handler, exactly once for everyone.

use std::sync::Arc;

use cxr_core::clock::MessageClock;
use cxr_core::message::{
    ApprovalCounterRequest, ApprovalCounterResult, ApproveTrajectory, GetTrajectoryRequest,
    GetTrajectoryResult, Message, SendTrajectory,
};
use cxr_core::status::ApprovalStatus;
use cxr_core::topics::TopicKind;

use crate::service::ServiceManager;

/// Protocol phase of this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Primary, waiting for the planner's trajectory.
    AwaitingTrajectory,
    /// Non-primary, operator review pending.
    ReviewingAsNonPrimary,
    /// Primary; peer discovery and approval collection run concurrently.
    AwaitingApprovals,
    /// Primary, quorum reached, waiting for the operator to execute.
    ReadyToExecute,
    /// Non-primary, approved, waiting for the consensus broadcast.
    AwaitingConsensusBroadcast,
}

/// Phases with a bounded wait; expiry aborts the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    AwaitingTrajectory,
    AwaitingApprovals,
    ReadyToExecute,
}

/// Notifications surfaced to the UI layer. The protocol never decides a
/// review on its own; these are the hooks the surrounding screens render.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A trajectory arrived and wants operator review.
    ReviewRequested { element_id: String },
    /// Quorum tally moved: `approved` of `present` peers.
    ApprovalProgress { approved: u32, present: u32 },
    /// Every discovered peer approved; execution is unlocked.
    QuorumReached { element_id: String },
    /// The transaction ended (rejection, consensus, or local teardown).
    TransactionClosed,
    /// Another device probed for presence while we hold the primary role:
    /// two requesters believe they are primary. The protocol has no leader
    /// election; this is surfaced for the operator, not resolved.
    PrimaryConflict { device_id: String },
    /// A bounded wait expired and the transaction was aborted.
    TimedOut { phase: Phase },
}

/// Boundary side effect of a transition, executed by the session driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(Message),
    Subscribe(TopicKind),
    Unsubscribe(TopicKind),
    /// Arm the bounded wait for a phase, replacing any armed deadline.
    ArmDeadline(Phase),
    /// Cancel any armed deadline.
    ClearDeadline,
    Notify(Notice),
}

/// Per-device approval state machine.
pub struct Machine {
    device_id: String,
    clock: Arc<MessageClock>,
    state: State,
    service: ServiceManager,
    current_element: Option<String>,
}

impl Machine {
    pub fn new(device_id: impl Into<String>, clock: Arc<MessageClock>) -> Self {
        Self {
            device_id: device_id.into(),
            clock,
            state: State::Idle,
            service: ServiceManager::new(),
            current_element: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn service(&self) -> &ServiceManager {
        &self.service
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn current_element(&self) -> Option<&str> {
        self.current_element.as_deref()
    }

    /// Operator requests a robot trajectory for a step. Only valid while
    /// idle; a device cannot open a second transaction.
    pub fn request(&mut self, element_id: &str) -> Vec<Effect> {
        if self.state != State::Idle {
            log::warn!(
                "request for element {element_id} refused in state {:?}",
                self.state
            );
            return Vec::new();
        }
        self.service.reset_transaction();
        self.service.set_primary(true);
        self.current_element = Some(element_id.to_owned());
        self.state = State::AwaitingTrajectory;
        vec![
            Effect::Publish(Message::GetTrajectoryRequest(GetTrajectoryRequest::new(
                &self.clock,
                &self.device_id,
                element_id,
            ))),
            Effect::ArmDeadline(Phase::AwaitingTrajectory),
        ]
    }

    /// Operator approves the trajectory under review.
    pub fn approve(&mut self) -> Vec<Effect> {
        if !matches!(
            self.state,
            State::ReviewingAsNonPrimary | State::AwaitingApprovals
        ) {
            log::warn!("approve ignored in state {:?}", self.state);
            return Vec::new();
        }
        let Some(element_id) = self.current_element.clone() else {
            log::warn!("approve ignored: no element under review");
            return Vec::new();
        };
        let trajectory = self.service.current_trajectory().cloned().unwrap_or_default();
        if self.state == State::ReviewingAsNonPrimary {
            self.state = State::AwaitingConsensusBroadcast;
        }
        vec![Effect::Publish(Message::ApproveTrajectory(
            ApproveTrajectory::new(
                &self.clock,
                &self.device_id,
                &element_id,
                trajectory,
                ApprovalStatus::Approved,
            ),
        ))]
    }

    /// Operator rejects the trajectory under review. State is torn down
    /// when the broadcast loops back, the same path every peer takes.
    pub fn reject(&mut self) -> Vec<Effect> {
        if matches!(self.state, State::Idle | State::AwaitingTrajectory) {
            log::warn!("reject ignored in state {:?}", self.state);
            return Vec::new();
        }
        let Some(element_id) = self.current_element.clone() else {
            log::warn!("reject ignored: no element under review");
            return Vec::new();
        };
        let trajectory = self.service.current_trajectory().cloned().unwrap_or_default();
        vec![Effect::Publish(Message::ApproveTrajectory(
            ApproveTrajectory::new(
                &self.clock,
                &self.device_id,
                &element_id,
                trajectory,
                ApprovalStatus::Rejected,
            ),
        ))]
    }

    /// Operator executes the approved trajectory: send it to the robot,
    /// then broadcast consensus to release every peer back to idle.
    pub fn execute(&mut self) -> Vec<Effect> {
        if self.state != State::ReadyToExecute {
            log::warn!("execute ignored in state {:?}", self.state);
            return Vec::new();
        }
        let Some(element_id) = self.current_element.clone() else {
            log::warn!("execute ignored: no element under review");
            return Vec::new();
        };
        let trajectory = self.service.current_trajectory().cloned().unwrap_or_default();
        let mut effects = vec![
            Effect::Publish(Message::SendTrajectory(SendTrajectory::new(
                &self.clock,
                &self.device_id,
                &element_id,
                trajectory.clone(),
            ))),
            Effect::Publish(Message::ApproveTrajectory(ApproveTrajectory::new(
                &self.clock,
                &self.device_id,
                &element_id,
                trajectory,
                ApprovalStatus::Consensus,
            ))),
        ];
        effects.extend(self.close_transaction());
        effects
    }

    /// Dispatch one inbound message. The caller guarantees mutual
    /// exclusion per device; counters stay atomic regardless.
    pub fn handle_message(&mut self, message: Message) -> Vec<Effect> {
        match message {
            Message::GetTrajectoryResult(result) => self.on_trajectory_result(result),
            Message::ApproveTrajectory(approval) => self.on_approval(approval),
            Message::ApprovalCounterRequest(request) => self.on_counter_request(request),
            Message::ApprovalCounterResult(result) => self.on_counter_result(result),
            other => {
                log::debug!("ignoring {:?} message", other.kind());
                Vec::new()
            }
        }
    }

    /// A bounded wait expired. Publishes a reject-equivalent so stuck
    /// transactions cannot wedge the whole group, then aborts locally.
    pub fn deadline_expired(&mut self, phase: Phase) -> Vec<Effect> {
        let expected = match phase {
            Phase::AwaitingTrajectory => State::AwaitingTrajectory,
            Phase::AwaitingApprovals => State::AwaitingApprovals,
            Phase::ReadyToExecute => State::ReadyToExecute,
        };
        if self.state != expected {
            log::debug!("stale deadline for {phase:?} in state {:?}", self.state);
            return Vec::new();
        }
        log::warn!("deadline expired in {phase:?}; aborting transaction");
        let mut effects = Vec::new();
        if let Some(element_id) = self.current_element.clone() {
            let trajectory = self.service.current_trajectory().cloned().unwrap_or_default();
            effects.push(Effect::Publish(Message::ApproveTrajectory(
                ApproveTrajectory::new(
                    &self.clock,
                    &self.device_id,
                    &element_id,
                    trajectory,
                    ApprovalStatus::Rejected,
                ),
            )));
        }
        effects.extend(self.abort());
        effects.push(Effect::Notify(Notice::TimedOut { phase }));
        effects
    }

    /// The transport reconnected: the primary role does not survive a
    /// connection gap, and any in-flight transaction is abandoned.
    pub fn on_reconnected(&mut self) -> Vec<Effect> {
        self.abort()
    }

    fn on_trajectory_result(&mut self, result: GetTrajectoryResult) -> Vec<Effect> {
        if self.service.is_primary() {
            if result.trajectory.is_empty() {
                // Planning failed; drop the role and free the request path.
                log::info!(
                    "empty trajectory for element {}; returning to idle",
                    result.element_id
                );
                // The scoped counter-result subscription was never taken in
                // this phase, so plain teardown is enough.
                return self.close_transaction();
            }
            let element_id = self
                .current_element
                .clone()
                .unwrap_or_else(|| result.element_id.clone());
            self.service.set_current_trajectory(result.trajectory);
            self.state = State::AwaitingApprovals;
            vec![
                Effect::Subscribe(TopicKind::ApprovalCounterResult),
                Effect::Publish(Message::ApprovalCounterRequest(ApprovalCounterRequest::new(
                    &self.clock,
                    &self.device_id,
                    &element_id,
                ))),
                Effect::ArmDeadline(Phase::AwaitingApprovals),
                Effect::Notify(Notice::ReviewRequested { element_id }),
            ]
        } else if !result.trajectory.is_empty() {
            let element_id = result.element_id.clone();
            self.current_element = Some(element_id.clone());
            self.service.set_current_trajectory(result.trajectory);
            self.state = State::ReviewingAsNonPrimary;
            vec![Effect::Notify(Notice::ReviewRequested { element_id })]
        } else {
            log::debug!("ignoring empty trajectory result as non-primary");
            Vec::new()
        }
    }

    fn on_counter_request(&mut self, request: ApprovalCounterRequest) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.service.is_primary() && request.header.device_id != self.device_id {
            // Two devices think they are primary. No election exists in the
            // protocol; surface it and keep going.
            log::warn!(
                "presence probe from {} while holding the primary role",
                request.header.device_id
            );
            effects.push(Effect::Notify(Notice::PrimaryConflict {
                device_id: request.header.device_id.clone(),
            }));
        }
        // Presence probes are answered unconditionally, echoing the probed
        // element, even mid-transaction on a different step.
        effects.push(Effect::Publish(Message::ApprovalCounterResult(
            ApprovalCounterResult::new(&self.clock, &self.device_id, &request.element_id),
        )));
        effects
    }

    fn on_counter_result(&mut self, result: ApprovalCounterResult) -> Vec<Effect> {
        if !self.service.is_primary() {
            log::debug!(
                "ignoring presence reply from {} while not primary",
                result.header.device_id
            );
            return Vec::new();
        }
        let present = self.service.user_count().increment();
        vec![Effect::Notify(Notice::ApprovalProgress {
            approved: self.service.approval_count().value(),
            present,
        })]
    }

    fn on_approval(&mut self, approval: ApproveTrajectory) -> Vec<Effect> {
        match approval.status() {
            Some(ApprovalStatus::Rejected) => {
                log::info!(
                    "trajectory {} rejected by {}",
                    approval.trajectory_id,
                    approval.header.device_id
                );
                self.abort()
            }
            Some(ApprovalStatus::Approved) => {
                if !self.service.is_primary() {
                    log::debug!(
                        "approval from {} ignored while not primary",
                        approval.header.device_id
                    );
                    return Vec::new();
                }
                let approved = self.service.approval_count().increment();
                let present = self.service.user_count().value();
                let mut effects = vec![Effect::Notify(Notice::ApprovalProgress {
                    approved,
                    present,
                })];
                if self.service.quorum_reached() {
                    self.state = State::ReadyToExecute;
                    effects.push(Effect::Unsubscribe(TopicKind::ApprovalCounterResult));
                    effects.push(Effect::ArmDeadline(Phase::ReadyToExecute));
                    effects.push(Effect::Notify(Notice::QuorumReached {
                        element_id: approval.element_id,
                    }));
                }
                effects
            }
            Some(ApprovalStatus::Consensus) => {
                log::info!(
                    "consensus for trajectory {}; transaction closed",
                    approval.trajectory_id
                );
                self.abort()
            }
            None => {
                log::warn!(
                    "unrecognized approval status {} from {}; ignoring",
                    approval.approval_status,
                    approval.header.device_id
                );
                Vec::new()
            }
        }
    }

    /// Shared teardown for rejection, consensus, timeouts, and reconnects.
    /// Releases the scoped counter-result subscription held by the primary.
    fn abort(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.service.is_primary() {
            effects.push(Effect::Unsubscribe(TopicKind::ApprovalCounterResult));
        }
        effects.extend(self.close_transaction());
        effects
    }

    fn close_transaction(&mut self) -> Vec<Effect> {
        let was_active = self.state != State::Idle || self.service.is_primary();
        self.service.set_primary(false);
        self.service.reset_transaction();
        self.current_element = None;
        self.state = State::Idle;
        let mut effects = vec![Effect::ClearDeadline];
        if was_active {
            effects.push(Effect::Notify(Notice::TransactionClosed));
        }
        effects
    }
}
