//! Message schema for the trajectory-approval protocol.
//!
//! Wire layout mirrors compas_xr's `mqtt/messages.py`: one JSON object per
//! message, header nested under `header`, snake_case keys. Field names are
//! interop surface with the Python and Unity clients; do not rename them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::{Header, MessageClock};
use crate::error::CodecError;
use crate::status::ApprovalStatus;
use crate::topics::TopicKind;

/// Ordered sequence of joint/pose vectors.
pub type Trajectory = Vec<Vec<f64>>;

/// Derive the trajectory identifier for an assembly step.
pub fn trajectory_id(element_id: &str) -> String {
    format!("trajectory_id_{element_id}")
}

/// JSON wire encoding shared by every message kind.
pub trait WirePayload: Serialize + DeserializeOwned + Sized {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// Ask the planner for a trajectory for one assembly step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTrajectoryRequest {
    pub header: Header,
    pub element_id: String,
    pub trajectory_id: String,
}

impl GetTrajectoryRequest {
    pub fn new(clock: &MessageClock, device_id: &str, element_id: &str) -> Self {
        Self {
            header: clock.header(device_id),
            element_id: element_id.to_owned(),
            trajectory_id: trajectory_id(element_id),
        }
    }
}

impl WirePayload for GetTrajectoryRequest {}

/// The planner's reply. An empty trajectory means planning failed and the
/// requester should drop its role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTrajectoryResult {
    pub header: Header,
    pub element_id: String,
    pub trajectory_id: String,
    pub trajectory: Trajectory,
}

impl GetTrajectoryResult {
    pub fn new(
        clock: &MessageClock,
        device_id: &str,
        element_id: &str,
        trajectory: Trajectory,
    ) -> Self {
        Self {
            header: clock.header(device_id),
            element_id: element_id.to_owned(),
            trajectory_id: trajectory_id(element_id),
            trajectory,
        }
    }
}

impl WirePayload for GetTrajectoryResult {}

/// A reviewer's verdict, or the final consensus broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproveTrajectory {
    pub header: Header,
    pub element_id: String,
    pub trajectory_id: String,
    pub trajectory: Trajectory,
    /// Raw status code as sent by the peer, which may be any integer; see
    /// [`ApprovalStatus`] for the recognized values.
    pub approval_status: i64,
}

impl ApproveTrajectory {
    pub fn new(
        clock: &MessageClock,
        device_id: &str,
        element_id: &str,
        trajectory: Trajectory,
        status: ApprovalStatus,
    ) -> Self {
        Self {
            header: clock.header(device_id),
            element_id: element_id.to_owned(),
            trajectory_id: trajectory_id(element_id),
            trajectory,
            approval_status: i64::from(status.as_u8()),
        }
    }

    /// Typed view of the status code, `None` for values outside the closed set.
    pub fn status(&self) -> Option<ApprovalStatus> {
        u8::try_from(self.approval_status)
            .ok()
            .and_then(|value| ApprovalStatus::try_from(value).ok())
    }
}

impl WirePayload for ApproveTrajectory {}

/// Presence probe: every listening device replies, which is how the primary
/// learns the peer count without a membership directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalCounterRequest {
    pub header: Header,
    pub element_id: String,
    pub trajectory_id: String,
}

impl ApprovalCounterRequest {
    pub fn new(clock: &MessageClock, device_id: &str, element_id: &str) -> Self {
        Self {
            header: clock.header(device_id),
            element_id: element_id.to_owned(),
            trajectory_id: trajectory_id(element_id),
        }
    }
}

impl WirePayload for ApprovalCounterRequest {}

/// Reply to a presence probe, echoing the probed element id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalCounterResult {
    pub header: Header,
    pub element_id: String,
    pub trajectory_id: String,
}

impl ApprovalCounterResult {
    pub fn new(clock: &MessageClock, device_id: &str, element_id: &str) -> Self {
        Self {
            header: clock.header(device_id),
            element_id: element_id.to_owned(),
            trajectory_id: trajectory_id(element_id),
        }
    }
}

impl WirePayload for ApprovalCounterResult {}

/// The execute command sent to the robot once quorum is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendTrajectory {
    pub header: Header,
    pub element_id: String,
    pub trajectory_id: String,
    pub trajectory: Trajectory,
}

impl SendTrajectory {
    pub fn new(
        clock: &MessageClock,
        device_id: &str,
        element_id: &str,
        trajectory: Trajectory,
    ) -> Self {
        Self {
            header: clock.header(device_id),
            element_id: element_id.to_owned(),
            trajectory_id: trajectory_id(element_id),
            trajectory,
        }
    }
}

impl WirePayload for SendTrajectory {}

/// Any protocol message, for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    GetTrajectoryRequest(GetTrajectoryRequest),
    GetTrajectoryResult(GetTrajectoryResult),
    ApproveTrajectory(ApproveTrajectory),
    ApprovalCounterRequest(ApprovalCounterRequest),
    ApprovalCounterResult(ApprovalCounterResult),
    SendTrajectory(SendTrajectory),
}

impl Message {
    /// Decode a payload delivered on the given topic kind.
    pub fn decode(kind: TopicKind, payload: &[u8]) -> Result<Self, CodecError> {
        Ok(match kind {
            TopicKind::GetTrajectoryRequest => {
                Message::GetTrajectoryRequest(GetTrajectoryRequest::decode(payload)?)
            }
            TopicKind::GetTrajectoryResult => {
                Message::GetTrajectoryResult(GetTrajectoryResult::decode(payload)?)
            }
            TopicKind::ApproveTrajectory => {
                Message::ApproveTrajectory(ApproveTrajectory::decode(payload)?)
            }
            TopicKind::ApprovalCounterRequest => {
                Message::ApprovalCounterRequest(ApprovalCounterRequest::decode(payload)?)
            }
            TopicKind::ApprovalCounterResult => {
                Message::ApprovalCounterResult(ApprovalCounterResult::decode(payload)?)
            }
            TopicKind::SendTrajectory => Message::SendTrajectory(SendTrajectory::decode(payload)?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Message::GetTrajectoryRequest(m) => m.encode(),
            Message::GetTrajectoryResult(m) => m.encode(),
            Message::ApproveTrajectory(m) => m.encode(),
            Message::ApprovalCounterRequest(m) => m.encode(),
            Message::ApprovalCounterResult(m) => m.encode(),
            Message::SendTrajectory(m) => m.encode(),
        }
    }

    pub fn kind(&self) -> TopicKind {
        match self {
            Message::GetTrajectoryRequest(_) => TopicKind::GetTrajectoryRequest,
            Message::GetTrajectoryResult(_) => TopicKind::GetTrajectoryResult,
            Message::ApproveTrajectory(_) => TopicKind::ApproveTrajectory,
            Message::ApprovalCounterRequest(_) => TopicKind::ApprovalCounterRequest,
            Message::ApprovalCounterResult(_) => TopicKind::ApprovalCounterResult,
            Message::SendTrajectory(_) => TopicKind::SendTrajectory,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Message::GetTrajectoryRequest(m) => &m.header,
            Message::GetTrajectoryResult(m) => &m.header,
            Message::ApproveTrajectory(m) => &m.header,
            Message::ApprovalCounterRequest(m) => &m.header,
            Message::ApprovalCounterResult(m) => &m.header,
            Message::SendTrajectory(m) => &m.header,
        }
    }

    pub fn element_id(&self) -> &str {
        match self {
            Message::GetTrajectoryRequest(m) => &m.element_id,
            Message::GetTrajectoryResult(m) => &m.element_id,
            Message::ApproveTrajectory(m) => &m.element_id,
            Message::ApprovalCounterRequest(m) => &m.element_id,
            Message::ApprovalCounterResult(m) => &m.element_id,
            Message::SendTrajectory(m) => &m.element_id,
        }
    }
}
