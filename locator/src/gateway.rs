//! Admission-controlled client for the segmentation service.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::imagery::ImagePayload;
use crate::projection::{CropSpec, GeoPoint, PixelPoint};
use crate::zone::{retain_valid, Zone, ZoneLabel};

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Segmentation service did not answer within {after:?}")]
    Timeout { after: Duration },
    #[error("Segmentation service unreachable: {0}")]
    Unreachable(String),
    #[error("Malformed segmentation response: {0}")]
    MalformedResponse(String),
    #[error("Segmentation service reported an error: {0}")]
    Service(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone)]
pub struct SegmentationRequest {
    pub image: ImagePayload,
    pub anchor: GeoPoint,
    pub zoom: Option<u8>,
    pub crop_width: Option<u32>,
    pub crop_height: Option<u32>,
}

impl SegmentationRequest {
    pub fn for_crop(image: ImagePayload, crop: &CropSpec) -> Self {
        Self {
            image,
            anchor: crop.anchor,
            zoom: Some(crop.zoom),
            crop_width: Some(crop.crop_size),
            crop_height: Some(crop.crop_size),
        }
    }

    pub fn to_wire(&self) -> WireRequest {
        WireRequest {
            image: self.image.to_data_url(),
            lat: self.anchor.lat,
            lng: self.anchor.lng,
            crop_width: self.crop_width,
            crop_height: self.crop_height,
            zoom: self.zoom,
        }
    }
}

/// JSON body posted to the segmentation service.
#[derive(Debug, Clone, Serialize)]
pub struct WireRequest {
    pub image: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoom: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default, alias = "zones")]
    poligoni: Option<Vec<WireZone>>,
    #[serde(default)]
    errore: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireZone {
    label: String,
    points: Vec<[f64; 2]>,
}

/// Parses a segmentation response body into zones.
///
/// Background and unknown labels are dropped here; geometric validity is
/// checked later by the gateway.
pub fn parse_response(body: &str) -> GatewayResult<Vec<Zone>> {
    let response: WireResponse = serde_json::from_str(body)
        .map_err(|err| GatewayError::MalformedResponse(err.to_string()))?;

    if let Some(message) = response.errore {
        return Err(GatewayError::Service(message));
    }
    let wire_zones = response
        .poligoni
        .ok_or_else(|| GatewayError::MalformedResponse("missing 'poligoni'".to_string()))?;

    let mut zones = Vec::with_capacity(wire_zones.len());
    for wire_zone in wire_zones {
        let Some(label) = ZoneLabel::from_wire(&wire_zone.label) else {
            debug!(label = %wire_zone.label, "Skipping zone with unknown label");
            continue;
        };
        if label == ZoneLabel::Background {
            continue;
        }
        let vertices = wire_zone
            .points
            .iter()
            .map(|[x, y]| PixelPoint::new(*x, *y))
            .collect();
        zones.push(Zone::new(label, vertices));
    }

    Ok(zones)
}

/// Transport to the segmentation service.
#[async_trait]
pub trait SegmentationBackend: Debug + Send + Sync {
    async fn segment(&self, request: &SegmentationRequest) -> GatewayResult<Vec<Zone>>;
}

#[derive(Debug, Clone)]
pub struct HttpSegmentationBackend {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSegmentationBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("locator/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Unreachable(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout {
                after: self.timeout,
            }
        } else if err.is_decode() || err.is_body() {
            GatewayError::MalformedResponse(err.to_string())
        } else {
            GatewayError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl SegmentationBackend for HttpSegmentationBackend {
    async fn segment(&self, request: &SegmentationRequest) -> GatewayResult<Vec<Zone>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request.to_wire())
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        let body = response.text().await.map_err(|err| self.transport_error(err))?;

        if !status.is_success() {
            return match parse_response(&body) {
                Err(GatewayError::Service(message)) => {
                    Err(GatewayError::Service(format!("{status}: {message}")))
                }
                _ => Err(GatewayError::MalformedResponse(format!(
                    "status {status} with body '{}'",
                    body.chars().take(200).collect::<String>()
                ))),
            };
        }

        parse_response(&body)
    }
}

/// Process-wide ceiling on in-flight segmentation calls.
///
/// Clones share the same slots. Waiters queue instead of being rejected.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionControl {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.get())),
            limit: limit.get(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> GatewayResult<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Unreachable("admission control closed".to_string()))
    }
}

impl TryFrom<usize> for AdmissionControl {
    type Error = ConfigError;

    fn try_from(limit: usize) -> Result<Self, Self::Error> {
        NonZeroUsize::new(limit)
            .map(Self::new)
            .ok_or_else(|| ConfigError("admission limit must be positive".to_string()))
    }
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_MAX_CONCURRENT).unwrap_or(NonZeroUsize::MIN))
    }
}

#[derive(Debug, Clone)]
pub struct SegmentationGateway {
    backend: Arc<dyn SegmentationBackend>,
    admission: AdmissionControl,
    timeout: Duration,
}

impl SegmentationGateway {
    pub fn new(
        backend: Arc<dyn SegmentationBackend>,
        admission: AdmissionControl,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            admission,
            timeout,
        }
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// One admitted, time-bounded call. Returns the geometrically valid zones.
    ///
    /// The timeout covers the call itself, not the wait for a free slot.
    /// Failures are returned as-is; retrying is left to the caller.
    pub async fn submit(&self, request: &SegmentationRequest) -> GatewayResult<Vec<Zone>> {
        let _permit = self.admission.acquire().await?;
        debug!(
            lat = request.anchor.lat,
            lng = request.anchor.lng,
            in_flight = self.admission.in_flight(),
            "Submitting segmentation request"
        );

        let zones = tokio::time::timeout(self.timeout, self.backend.segment(request))
            .await
            .map_err(|_| {
                warn!(timeout = ?self.timeout, "Segmentation request timed out");
                GatewayError::Timeout {
                    after: self.timeout,
                }
            })??;

        let received = zones.len();
        let zones = retain_valid(zones);
        debug!(received, valid = zones.len(), "Segmentation response parsed");

        Ok(zones)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Replays a fixed sequence of responses; empty once the script runs out.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedBackend {
        script: Mutex<VecDeque<GatewayResult<Vec<Zone>>>>,
        pub(crate) requests: Mutex<Vec<GeoPoint>>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
    }

    impl ScriptedBackend {
        pub(crate) fn new(script: Vec<GatewayResult<Vec<Zone>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    pub(crate) fn admission(limit: usize) -> AdmissionControl {
        AdmissionControl::try_from(limit).expect("positive ceiling")
    }

    #[async_trait]
    impl SegmentationBackend for ScriptedBackend {
        async fn segment(&self, request: &SegmentationRequest) -> GatewayResult<Vec<Zone>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.requests.lock().push(request.anchor);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().pop_front().unwrap_or(Ok(vec![]));

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            next
        }
    }
}
