//! Delivery relay API
//!
//! Browsers cannot reach arbitrary tracking servers (CORS, mixed content), so
//! the background agent posts each position here and the relay forwards it.
//! The HTTP status reflects the failure class: 400 validation, 502 upstream
//! failure, 504 upstream timeout.

use beacon_core::relay::RelayRequest;
use beacon_core::{DeliveryFailure, FailureKind};
use poem::endpoint::StaticFilesEndpoint;
use poem::middleware::Cors;
use poem::{Endpoint, EndpointExt, Route};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi, OpenApiService};
use std::sync::Arc;

use crate::forward::Forwarder;

pub struct RelayApi {
    pub forwarder: Arc<Forwarder>,
}

#[derive(Debug, Object)]
#[oai(rename_all = "camelCase")]
pub struct PositionRequest {
    /// Tracking server endpoint (http/https)
    pub server_url: String,
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
}

impl From<PositionRequest> for RelayRequest {
    fn from(req: PositionRequest) -> Self {
        RelayRequest {
            server_url: req.server_url,
            device_id: req.device_id,
            lat: req.lat,
            lon: req.lon,
            timestamp: req.timestamp,
            accuracy: req.accuracy,
            altitude: req.altitude,
            speed: req.speed,
            bearing: req.bearing,
        }
    }
}

#[derive(Debug, Object)]
pub struct PositionResponse {
    pub success: bool,
    #[oai(skip_serializing_if_is_none)]
    pub message: Option<String>,
    /// Failure class, e.g. `connection_refused`
    #[oai(skip_serializing_if_is_none)]
    pub kind: Option<String>,
}

impl PositionResponse {
    fn delivered() -> Self {
        Self {
            success: true,
            message: Some("Position forwarded".to_string()),
            kind: None,
        }
    }

    fn failed(failure: &DeliveryFailure) -> Self {
        Self {
            success: false,
            message: Some(failure.reason.clone()),
            kind: Some(failure.kind.tag().to_string()),
        }
    }
}

#[derive(Debug, Object)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timeout_secs: u64,
}

#[derive(ApiResponse)]
#[oai(bad_request_handler = "bad_request")]
pub enum PositionResult {
    #[oai(status = 200)]
    Delivered(Json<PositionResponse>),
    #[oai(status = 400)]
    Invalid(Json<PositionResponse>),
    #[oai(status = 502)]
    BadGateway(Json<PositionResponse>),
    #[oai(status = 504)]
    GatewayTimeout(Json<PositionResponse>),
}

impl PositionResult {
    fn failure(failure: &DeliveryFailure) -> Self {
        let body = Json(PositionResponse::failed(failure));
        match failure.kind.http_status() {
            400 => PositionResult::Invalid(body),
            504 => PositionResult::GatewayTimeout(body),
            _ => PositionResult::BadGateway(body),
        }
    }
}

/// Undecodable bodies get the same JSON shape as any other validation failure
fn bad_request(err: poem::Error) -> PositionResult {
    PositionResult::failure(&DeliveryFailure::with_reason(
        FailureKind::Validation,
        format!("Invalid request: {}", err),
    ))
}

#[OpenApi]
impl RelayApi {
    /// Forward one position to its tracking server
    #[oai(path = "/position", method = "post")]
    async fn position(&self, Json(req): Json<PositionRequest>) -> PositionResult {
        let (sample, destination) = match RelayRequest::from(req).into_parts() {
            Ok(parts) => parts,
            Err(failure) => {
                tracing::warn!("Rejected position: {}", failure.reason);
                return PositionResult::failure(&failure);
            }
        };

        match self.forwarder.forward(&destination, &sample).await {
            Ok(()) => {
                tracing::info!(
                    "Forwarded {} ({:.6}, {:.6}) to {}",
                    destination.device_identifier,
                    sample.latitude,
                    sample.longitude,
                    destination.server_endpoint
                );
                PositionResult::Delivered(Json(PositionResponse::delivered()))
            }
            Err(failure) => {
                tracing::warn!(
                    "Forward to {} failed ({}): {}",
                    destination.server_endpoint,
                    failure.kind.tag(),
                    failure.reason
                );
                PositionResult::failure(&failure)
            }
        }
    }

    /// Health check
    #[oai(path = "/health", method = "get")]
    async fn health(&self) -> Json<HealthResponse> {
        Json(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timeout_secs: self.forwarder.timeout().as_secs(),
        })
    }
}

/// `/api/*`, `/docs`, `/spec`, and the page bundle at `/` when configured
pub fn build_app(forwarder: Forwarder, static_dir: Option<&str>) -> impl Endpoint {
    let api = RelayApi {
        forwarder: Arc::new(forwarder),
    };
    let api_service =
        OpenApiService::new(api, "GPS Beacon Relay", env!("CARGO_PKG_VERSION")).server("/api");

    let ui = api_service.scalar();
    let spec = api_service.spec_endpoint();

    let mut app = Route::new()
        .nest("/api", api_service)
        .nest("/docs", ui)
        .nest("/spec", spec);

    if let Some(dir) = static_dir {
        app = app.nest("/", StaticFilesEndpoint::new(dir).index_file("index.html"));
    }

    app.with(Cors::new())
}
