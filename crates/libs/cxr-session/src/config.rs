//! Session configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::SessionError;
use crate::machine::Phase;

/// Bounded waits per protocol phase. The protocol's only built-in abort
/// path is another device's rejection; these deadlines make sure a stalled
/// transaction ends even when nobody rejects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Deadlines {
    /// Wait for the planner's trajectory result.
    pub trajectory_secs: u64,
    /// Wait for presence replies and approvals.
    pub approvals_secs: u64,
    /// Wait for the operator to execute after quorum.
    pub execute_secs: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            trajectory_secs: 30,
            approvals_secs: 120,
            execute_secs: 300,
        }
    }
}

impl Deadlines {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::AwaitingTrajectory => self.trajectory_secs,
            Phase::AwaitingApprovals => self.approvals_secs,
            Phase::ReadyToExecute => self.execute_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Everything a device session needs: where the broker lives, which
/// project's topics to derive, and who we are on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Broker address, user-overridable at runtime.
    pub broker_host: String,
    pub broker_port: u16,
    /// Project name the topic set derives from; supplied by the settings
    /// collaborator.
    pub project_name: String,
    /// Stable identifier stamped into every outbound header.
    pub device_id: String,
    pub deadlines: Deadlines,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_owned(),
            broker_port: 1883,
            project_name: "default_project".to_owned(),
            device_id: String::new(),
            deadlines: Deadlines::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document; unspecified keys fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, SessionError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }
}
