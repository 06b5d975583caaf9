//! Core schema for the COMPAS XR trajectory-approval protocol.
//!
//! Devices collaborating on a shared assembly negotiate robot trajectories
//! over broadcast-only publish/subscribe topics. This crate holds the pieces
//! every participant agrees on:
//!
//! - [`clock`] — shared monotonic sequence/response identifiers and the
//!   message header they stamp
//! - [`message`] — the six message kinds and their JSON wire encoding
//! - [`status`] — the closed set of approval status codes
//! - [`topics`] — topic names derived from the project name
//!
//! The negotiation itself (roles, quorum counting, state machine) lives in
//! `cxr-session`; this crate stays transport-free and side-effect-free apart
//! from the shared counters.

pub mod clock;
mod error;
pub mod message;
pub mod status;
pub mod topics;

pub use clock::{Header, MessageClock};
pub use error::CodecError;
pub use message::{
    ApprovalCounterRequest, ApprovalCounterResult, ApproveTrajectory, GetTrajectoryRequest,
    GetTrajectoryResult, Message, SendTrajectory, Trajectory, WirePayload,
};
pub use status::ApprovalStatus;
pub use topics::{TopicKind, TopicSet};
