// Page <-> agent control channel messages
//
// page -> agent: { "command": "...", "data": { ... } }
// agent -> page: { "type": "...", "message": "...", "isTracking": bool }

use serde::{Deserialize, Serialize};

use crate::config::{ConfigUpdate, TrackingConfiguration};
use crate::relay::Destination;
use crate::sample::LocationSample;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "kebab-case")]
pub enum PageCommand {
    StartTracking { config: TrackingConfiguration },
    StopTracking,
    LocationUpdate(LocationUpdate),
    UpdateConfig(ConfigUpdate),
    GetStatus,
}

/// A sample plus the destination the page had configured when it was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    #[serde(flatten)]
    pub sample: LocationSample,
    #[serde(flatten)]
    pub destination: Destination,
}

impl PageCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PageCommand::StartTracking { .. } => "start-tracking",
            PageCommand::StopTracking => "stop-tracking",
            PageCommand::LocationUpdate(_) => "location-update",
            PageCommand::UpdateConfig(_) => "update-config",
            PageCommand::GetStatus => "get-status",
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Informational, e.g. a delivery is being attempted
    Status { message: String },
    /// Terminal delivery success
    Success { message: String },
    /// Terminal delivery failure or other fault
    Error { message: String },
    /// Authoritative on/off state, broadcast to every connected page
    TrackingStatus {
        #[serde(rename = "isTracking")]
        is_tracking: bool,
        message: String,
    },
}

impl AgentMessage {
    pub fn status(message: impl Into<String>) -> Self {
        AgentMessage::Status {
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        AgentMessage::Success {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentMessage::Error {
            message: message.into(),
        }
    }

    pub fn tracking(is_tracking: bool, message: impl Into<String>) -> Self {
        AgentMessage::TrackingStatus {
            is_tracking,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AgentMessage::Status { message }
            | AgentMessage::Success { message }
            | AgentMessage::Error { message }
            | AgentMessage::TrackingStatus { message, .. } => message,
        }
    }

    /// Success or error: the single outcome of one delivery attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentMessage::Success { .. } | AgentMessage::Error { .. })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
