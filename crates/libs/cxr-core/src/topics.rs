//! Topic names derived from the project name.
//!
//! Every topic string is a pure function of the project name; changing the
//! project requires re-deriving (and re-subscribing to) the full set.

/// Namespace prefix shared with the Python and Unity peers.
pub const NAMESPACE: &str = "compas_xr";

/// The six message kinds, one per topic purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    GetTrajectoryRequest,
    GetTrajectoryResult,
    ApproveTrajectory,
    ApprovalCounterRequest,
    ApprovalCounterResult,
    SendTrajectory,
}

impl TopicKind {
    fn purpose(self) -> &'static str {
        match self {
            TopicKind::GetTrajectoryRequest => "get_trajectory_request",
            TopicKind::GetTrajectoryResult => "get_trajectory_result",
            TopicKind::ApproveTrajectory => "approve_trajectory",
            TopicKind::ApprovalCounterRequest => "approval_counter_request",
            TopicKind::ApprovalCounterResult => "approval_counter_result",
            TopicKind::SendTrajectory => "send_trajectory",
        }
    }
}

/// Topics a device publishes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishers {
    pub get_trajectory_request: String,
    pub approval_counter_request: String,
    pub approval_counter_result: String,
    pub approve_trajectory: String,
    pub send_trajectory: String,
}

/// Topics a device subscribes to. `approval_counter_result` is scoped: only
/// subscribed while this device is primary and gathering approvals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribers {
    pub get_trajectory_result: String,
    pub approve_trajectory: String,
    pub approval_counter_request: String,
    pub approval_counter_result: String,
}

/// The full topic set for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub project_name: String,
    pub publishers: Publishers,
    pub subscribers: Subscribers,
}

impl TopicSet {
    pub fn new(project_name: &str) -> Self {
        let topic = |kind: TopicKind| format!("{NAMESPACE}/{}/{project_name}", kind.purpose());
        Self {
            project_name: project_name.to_owned(),
            publishers: Publishers {
                get_trajectory_request: topic(TopicKind::GetTrajectoryRequest),
                approval_counter_request: topic(TopicKind::ApprovalCounterRequest),
                approval_counter_result: topic(TopicKind::ApprovalCounterResult),
                approve_trajectory: topic(TopicKind::ApproveTrajectory),
                send_trajectory: topic(TopicKind::SendTrajectory),
            },
            subscribers: Subscribers {
                get_trajectory_result: topic(TopicKind::GetTrajectoryResult),
                approve_trajectory: topic(TopicKind::ApproveTrajectory),
                approval_counter_request: topic(TopicKind::ApprovalCounterRequest),
                approval_counter_result: topic(TopicKind::ApprovalCounterResult),
            },
        }
    }

    /// Topic string this device publishes the given kind on. `None` for
    /// `GetTrajectoryResult`, which only the planner publishes.
    pub fn publish_topic(&self, kind: TopicKind) -> Option<&str> {
        match kind {
            TopicKind::GetTrajectoryRequest => Some(&self.publishers.get_trajectory_request),
            TopicKind::ApprovalCounterRequest => Some(&self.publishers.approval_counter_request),
            TopicKind::ApprovalCounterResult => Some(&self.publishers.approval_counter_result),
            TopicKind::ApproveTrajectory => Some(&self.publishers.approve_trajectory),
            TopicKind::SendTrajectory => Some(&self.publishers.send_trajectory),
            TopicKind::GetTrajectoryResult => None,
        }
    }

    /// Topic string for a scoped or base subscription.
    pub fn subscribe_topic(&self, kind: TopicKind) -> Option<&str> {
        match kind {
            TopicKind::GetTrajectoryResult => Some(&self.subscribers.get_trajectory_result),
            TopicKind::ApproveTrajectory => Some(&self.subscribers.approve_trajectory),
            TopicKind::ApprovalCounterRequest => Some(&self.subscribers.approval_counter_request),
            TopicKind::ApprovalCounterResult => Some(&self.subscribers.approval_counter_result),
            _ => None,
        }
    }

    /// Subscriptions held for the whole lifetime of a connection.
    pub fn base_subscriptions(&self) -> [&str; 3] {
        [
            &self.subscribers.get_trajectory_result,
            &self.subscribers.approve_trajectory,
            &self.subscribers.approval_counter_request,
        ]
    }

    /// Classify an inbound topic string.
    pub fn resolve(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.subscribers.get_trajectory_result {
            Some(TopicKind::GetTrajectoryResult)
        } else if topic == self.subscribers.approve_trajectory {
            Some(TopicKind::ApproveTrajectory)
        } else if topic == self.subscribers.approval_counter_request {
            Some(TopicKind::ApprovalCounterRequest)
        } else if topic == self.subscribers.approval_counter_result {
            Some(TopicKind::ApprovalCounterResult)
        } else {
            None
        }
    }
}
