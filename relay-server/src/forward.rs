//! Forwarding to the remote tracking server
//!
//! One HTTP POST per position:
//! `<serverEndpoint>?id=..&lat=..&lon=..&timestamp=..[&accuracy&altitude&speed&bearing]`
//! Any 2xx is a delivery. Transport errors are classified into a FailureKind
//! so the page can tell the user what went wrong.

use anyhow::{Context, Result};
use beacon_core::{DeliveryFailure, Destination, FailureKind, LocationSample};
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use url::Url;

pub struct Forwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self> {
        let user_agent = user_agent
            .map(str::to_string)
            .unwrap_or_else(|| format!("beacon-relay/{}", env!("CARGO_PKG_VERSION")));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn forward(
        &self,
        destination: &Destination,
        sample: &LocationSample,
    ) -> Result<(), DeliveryFailure> {
        let url = tracking_url(destination, sample).map_err(|e| {
            DeliveryFailure::with_reason(
                FailureKind::Validation,
                format!("Invalid request: server URL ({})", e),
            )
        })?;

        tracing::debug!("POST {}", url);
        match self.client.post(url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(DeliveryFailure::rejected(response.status().as_u16())),
            Err(e) => Err(classify(&e)),
        }
    }
}

/// Destination URL with the position in the query string
pub fn tracking_url(
    destination: &Destination,
    sample: &LocationSample,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&destination.server_endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("id", &destination.device_identifier)
            .append_pair("lat", &sample.latitude.to_string())
            .append_pair("lon", &sample.longitude.to_string())
            .append_pair("timestamp", &sample.capture_time_seconds.to_string());

        let optional = [
            ("accuracy", sample.accuracy_meters),
            ("altitude", sample.altitude_meters),
            ("speed", sample.speed_meters_per_second),
            ("bearing", sample.bearing_degrees),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                query.append_pair(name, &value.to_string());
            }
        }
    }
    Ok(url)
}

fn classify(error: &reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        return DeliveryFailure::new(FailureKind::Timeout);
    }

    // io::ErrorKind is the most reliable signal; messages are the fallback.
    // The top-level error carries the request URL, so only its causes are read.
    let mut text = String::new();
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            match io_error.kind() {
                io::ErrorKind::ConnectionRefused => {
                    return DeliveryFailure::new(FailureKind::ConnectionRefused)
                }
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return DeliveryFailure::new(FailureKind::ConnectionReset)
                }
                io::ErrorKind::TimedOut => return DeliveryFailure::new(FailureKind::Timeout),
                _ => {}
            }
        }
        text.push_str(&cause.to_string());
        text.push(' ');
        source = cause.source();
    }

    match classify_text(&text) {
        Some(kind) => DeliveryFailure::new(kind),
        None if error.is_connect() => DeliveryFailure::new(FailureKind::Unreachable),
        None => DeliveryFailure::with_reason(
            FailureKind::Relay,
            format!("Forwarding failed: {}", error),
        ),
    }
}

/// Map an error message chain to a failure class
pub fn classify_text(text: &str) -> Option<FailureKind> {
    let text = text.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if any(&[
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ]) {
        Some(FailureKind::HostNotFound)
    } else if any(&["certificate", "tls", "ssl", "handshake"]) {
        Some(FailureKind::Certificate)
    } else if any(&["connection refused"]) {
        Some(FailureKind::ConnectionRefused)
    } else if any(&["connection reset", "broken pipe", "connection closed"]) {
        Some(FailureKind::ConnectionReset)
    } else if any(&["timed out", "timeout"]) {
        Some(FailureKind::Timeout)
    } else if any(&["network is unreachable", "no route to host", "host is down"]) {
        Some(FailureKind::Unreachable)
    } else {
        None
    }
}
