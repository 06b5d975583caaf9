//! Per-device negotiation layer for the COMPAS XR trajectory protocol.
//!
//! The hard part of the protocol is not the wire format but the ad-hoc
//! consensus round: request a trajectory, discover how many peers are
//! listening by counting presence replies, collect approvals until the
//! tally matches the peer count, then execute and release everyone.
//!
//! Layering, boundary side effects as data:
//!
//! - [`machine`] — the pure state machine; transitions return [`machine::Effect`]s
//! - [`session`] — the async driver executing effects against a [`transport::Transport`]
//! - [`service`] / [`counter`] — transaction state and quorum counters
//! - [`config`] — broker address, project name, phase deadlines

pub mod config;
pub mod counter;
mod error;
pub mod machine;
pub mod service;
pub mod session;
pub mod transport;

pub use config::{Deadlines, SessionConfig};
pub use counter::Counter;
pub use error::SessionError;
pub use machine::{Effect, Machine, Notice, Phase, State};
pub use service::ServiceManager;
pub use session::{Session, SessionEvent};
pub use transport::{Delivery, QosLevel, Transport, TransportError};
