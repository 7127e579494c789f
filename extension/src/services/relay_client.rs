// HTTP client for the delivery relay
//
// POSTs the RelayRequest JSON to `<relay>/api/position` through fetch and
// turns the answer back into a DeliveryFailure. The relay enforces its own
// upstream timeout; ours is a little longer so its classified answer wins.

use async_trait::async_trait;
use beacon_core::config::{validate_server_url, ConfigError};
use beacon_core::relay::{RelayRequest, RelayResponse, DEFAULT_RELAY_TIMEOUT};
use beacon_core::{DeliveryFailure, DeliveryRelay, Destination, FailureKind, LocationSample};
use futures::future::{self, Either};
use gloo_timers::future::TimeoutFuture;
use std::time::Duration;

const POSITION_PATH: &str = "/api/position";
const CLIENT_GRACE: Duration = Duration::from_secs(5);

pub struct HttpRelay {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(relay_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: position_endpoint(relay_url)?,
            timeout: DEFAULT_RELAY_TIMEOUT + CLIENT_GRACE,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &RelayRequest) -> Result<(), DeliveryFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                log::warn!("Relay request failed: {}", e);
                DeliveryFailure::with_reason(
                    FailureKind::Relay,
                    "Could not reach the relay service",
                )
            })?;

        let status = response.status().as_u16();
        let body = response.json::<RelayResponse>().await.ok();
        RelayResponse::interpret(status, body)
    }
}

#[async_trait(?Send)]
impl DeliveryRelay for HttpRelay {
    async fn deliver(
        &self,
        sample: &LocationSample,
        destination: &Destination,
    ) -> Result<(), DeliveryFailure> {
        let request = RelayRequest::new(sample, destination);
        let post = self.post(&request);
        let timeout = TimeoutFuture::new(self.timeout.as_millis() as u32);
        futures::pin_mut!(post, timeout);

        match future::select(post, timeout).await {
            Either::Left((outcome, _)) => outcome,
            Either::Right(((), _)) => Err(DeliveryFailure::new(FailureKind::Timeout)),
        }
    }
}

/// `<relay base>/api/position`, tolerating a trailing slash or a full path
fn position_endpoint(relay_url: &str) -> Result<String, ConfigError> {
    let base = validate_server_url(relay_url)?;
    let base = base.trim_end_matches('/');
    if base.ends_with(POSITION_PATH) {
        return Ok(base.to_string());
    }
    Ok(format!("{}{}", base, POSITION_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_endpoint() {
        assert_eq!(
            position_endpoint("http://localhost:3000").unwrap(),
            "http://localhost:3000/api/position"
        );
        assert_eq!(
            position_endpoint("https://relay.example.org/").unwrap(),
            "https://relay.example.org/api/position"
        );
        assert_eq!(
            position_endpoint("https://relay.example.org/api/position").unwrap(),
            "https://relay.example.org/api/position"
        );
    }

    #[test]
    fn test_position_endpoint_rejects_bad_base() {
        assert!(matches!(
            position_endpoint("relay.example.org"),
            Err(ConfigError::InvalidServerUrl(_))
        ));
        assert!(position_endpoint("ftp://relay.example.org").is_err());
    }
}
