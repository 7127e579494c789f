// Delivery relay contract
//
// The agent never talks to the tracking server itself. It hands one sample
// and its destination to a DeliveryRelay and gets back success or a
// classified failure whose reason is shown to the user verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::{validate_device_id, validate_server_url};
use crate::sample::LocationSample;

/// Upper bound for one relay round-trip
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub server_endpoint: String,
    pub device_identifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    ConnectionRefused,
    HostNotFound,
    ConnectionReset,
    Unreachable,
    Timeout,
    RemoteRejected,
    Certificate,
    Relay,
}

impl FailureKind {
    pub fn default_reason(self) -> &'static str {
        match self {
            FailureKind::Validation => "The position or settings were rejected as invalid",
            FailureKind::ConnectionRefused => "Connection refused by the tracking server",
            FailureKind::HostNotFound => "Tracking server address could not be resolved",
            FailureKind::ConnectionReset => "Connection to the tracking server was reset",
            FailureKind::Unreachable => "Tracking server is unreachable",
            FailureKind::Timeout => "Tracking server did not respond in time",
            FailureKind::RemoteRejected => "Tracking server rejected the position",
            FailureKind::Certificate => "Tracking server certificate could not be verified",
            FailureKind::Relay => "Relay service error",
        }
    }

    /// Wire tag, as it appears in the relay response `kind`
    pub fn tag(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::HostNotFound => "host_not_found",
            FailureKind::ConnectionReset => "connection_reset",
            FailureKind::Unreachable => "unreachable",
            FailureKind::Timeout => "timeout",
            FailureKind::RemoteRejected => "remote_rejected",
            FailureKind::Certificate => "certificate",
            FailureKind::Relay => "relay",
        }
    }

    /// HTTP status the relay answers with for this failure
    pub fn http_status(self) -> u16 {
        match self {
            FailureKind::Validation => 400,
            FailureKind::Timeout => 504,
            _ => 502,
        }
    }

    /// Best guess when the relay did not name the kind
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => FailureKind::Validation,
            502 => FailureKind::RemoteRejected,
            504 => FailureKind::Timeout,
            _ => FailureKind::Relay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct DeliveryFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl DeliveryFailure {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            reason: kind.default_reason().to_string(),
        }
    }

    pub fn with_reason(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn rejected(status: u16) -> Self {
        Self::with_reason(
            FailureKind::RemoteRejected,
            format!("Tracking server rejected the position (HTTP {})", status),
        )
    }
}

/// Performs the network call for one sample
///
/// Callers guarantee at most one outstanding call per agent.
#[async_trait(?Send)]
pub trait DeliveryRelay {
    async fn deliver(
        &self,
        sample: &LocationSample,
        destination: &Destination,
    ) -> Result<(), DeliveryFailure>;
}

/// JSON body of the relay endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub server_url: String,
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
}

impl RelayRequest {
    pub fn new(sample: &LocationSample, destination: &Destination) -> Self {
        Self {
            server_url: destination.server_endpoint.clone(),
            device_id: destination.device_identifier.clone(),
            lat: sample.latitude,
            lon: sample.longitude,
            timestamp: sample.capture_time_seconds,
            accuracy: sample.accuracy_meters,
            altitude: sample.altitude_meters,
            speed: sample.speed_meters_per_second,
            bearing: sample.bearing_degrees,
        }
    }

    /// Validate and split back into the sample and where it goes
    pub fn into_parts(self) -> Result<(LocationSample, Destination), DeliveryFailure> {
        let device_identifier = validate_device_id(&self.device_id).map_err(invalid)?;
        let server_endpoint = validate_server_url(&self.server_url).map_err(invalid)?;

        let sample = LocationSample::new(self.lat, self.lon, self.timestamp)
            .with_accuracy(self.accuracy)
            .with_altitude(self.altitude)
            .with_speed(self.speed)
            .with_bearing(self.bearing);
        sample.validate().map_err(invalid)?;

        Ok((
            sample,
            Destination {
                server_endpoint,
                device_identifier,
            },
        ))
    }
}

fn invalid(error: impl std::fmt::Display) -> DeliveryFailure {
    DeliveryFailure::with_reason(FailureKind::Validation, format!("Invalid request: {}", error))
}

/// JSON answer of the relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl RelayResponse {
    pub fn delivered(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            kind: None,
        }
    }

    pub fn failed(failure: &DeliveryFailure) -> Self {
        Self {
            success: false,
            message: Some(failure.reason.clone()),
            kind: Some(failure.kind),
        }
    }

    /// Interpret a relay answer; `body` is None when it was not valid JSON
    pub fn interpret(status: u16, body: Option<RelayResponse>) -> Result<(), DeliveryFailure> {
        match body {
            Some(response) if response.success && (200..300).contains(&status) => Ok(()),
            Some(response) => {
                let kind = response
                    .kind
                    .unwrap_or_else(|| FailureKind::from_http_status(status));
                Err(match response.message {
                    Some(reason) if !reason.trim().is_empty() => {
                        DeliveryFailure::with_reason(kind, reason)
                    }
                    _ => DeliveryFailure::new(kind),
                })
            }
            None => Err(DeliveryFailure::with_reason(
                FailureKind::Relay,
                format!("Relay service answered HTTP {} without a usable body", status),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Destination {
        Destination {
            server_endpoint: "http://example.com:5055".into(),
            device_identifier: "dev1".into(),
        }
    }

    #[test]
    fn test_request_wire_format() {
        let sample = LocationSample::new(48.85, 2.35, 1_700_000_000).with_speed(Some(3.0));
        let json = serde_json::to_value(RelayRequest::new(&sample, &destination())).unwrap();

        assert_eq!(json["serverUrl"], "http://example.com:5055");
        assert_eq!(json["deviceId"], "dev1");
        assert_eq!(json["lat"], 48.85);
        assert_eq!(json["timestamp"], 1_700_000_000i64);
        assert_eq!(json["speed"], 3.0);
        assert!(json.get("accuracy").is_none());
    }

    #[test]
    fn test_into_parts_rejects_bad_input() {
        let sample = LocationSample::new(48.85, 2.35, 0);

        let mut request = RelayRequest::new(&sample, &destination());
        request.server_url = "gopher://example.com".into();
        let failure = request.into_parts().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Validation);
        assert!(failure.reason.contains("Server URL"));

        let mut request = RelayRequest::new(&sample, &destination());
        request.lat = 123.0;
        assert_eq!(
            request.into_parts().unwrap_err().kind,
            FailureKind::Validation
        );
    }

    #[test]
    fn test_interpret_relay_answers() {
        assert!(RelayResponse::interpret(200, Some(RelayResponse::delivered("ok"))).is_ok());

        let refused = DeliveryFailure::new(FailureKind::ConnectionRefused);
        let failure =
            RelayResponse::interpret(502, Some(RelayResponse::failed(&refused))).unwrap_err();
        assert_eq!(failure, refused);

        let failure = RelayResponse::interpret(
            504,
            Some(RelayResponse {
                success: false,
                message: None,
                kind: None,
            }),
        )
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.reason, FailureKind::Timeout.default_reason());

        let failure = RelayResponse::interpret(500, None).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Relay);
        assert!(failure.reason.contains("500"));
    }

    #[test]
    fn test_failure_status_mapping() {
        assert_eq!(FailureKind::Validation.http_status(), 400);
        assert_eq!(FailureKind::Timeout.http_status(), 504);
        assert_eq!(FailureKind::Certificate.http_status(), 502);
    }

    #[test]
    fn test_tag_matches_serde_name() {
        for kind in [
            FailureKind::Validation,
            FailureKind::HostNotFound,
            FailureKind::RemoteRejected,
            FailureKind::Relay,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.tag());
        }
    }
}
