//! Round-based refinement loop: detect, select, project, evaluate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RefinementConfig, MAX_ZOOM};
use crate::gateway::{SegmentationGateway, SegmentationRequest};
use crate::imagery::{CropImager, ImageError, ImagePayload};
use crate::projection::{CropSpec, GeoPoint};
use crate::selector::{Selection, ZoneSelector};
use crate::site_store::{SiteKey, StoreError};
use crate::zone::ZoneLabel;

#[derive(Debug, Error)]
pub enum RefineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Site {0} not found")]
    SiteNotFound(SiteKey),
    #[error("Site store failed: {0}")]
    Store(#[from] StoreError),
    #[error("Crop capture failed: {0}")]
    Capture(#[from] ImageError),
    #[error("Round {round} did not finish within {after:?}")]
    StepTimeout { round: u32, after: Duration },
    /// The refinement finished but its coordinate could not be written.
    #[error("Failed to persist refined coordinate: {source}")]
    Persistence {
        result: Box<RefinementResult>,
        #[source]
        source: StoreError,
    },
}

pub type RefineResult<T> = std::result::Result<T, RefineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefinementPhase {
    Init,
    AwaitingDetection,
    Evaluating,
    Continuing,
    Converged,
    Exhausted,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Converged,
    Exhausted,
    NoDetection,
}

/// Loop state, owned by a single refinement and mutated between rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementState {
    /// 1-based round currently being run.
    pub round: u32,
    /// Segmentation attempts spent in the current round.
    pub attempt: u32,
    pub anchor: GeoPoint,
    pub origin: GeoPoint,
    pub zoom: u8,
    pub crop_size: u32,
    pub previous_density: usize,
    pub last_distance_px: Option<f64>,
    pub phase: RefinementPhase,
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementResult {
    pub coordinate: GeoPoint,
    pub rounds: u32,
    pub final_distance_px: f64,
    pub density_score: usize,
    pub outcome: Outcome,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_label: Option<ZoneLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_area_m2: Option<f64>,
}

/// Everything one refinement needs once the starting anchor is known.
#[derive(Debug, Clone)]
pub struct RefinementInput {
    pub anchor: GeoPoint,
    pub zoom: u8,
    pub crop_size: u32,
    pub image: ImagePayload,
}

/// Input for a single round when the caller drives the loop.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub input: RefinementInput,
    /// 1-based round number of this step.
    pub round: u32,
    pub previous_density: usize,
    /// Distance reported by the previous step; `None` on the first round.
    pub previous_distance_px: Option<f64>,
}

/// Outcome of one externally driven round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepReport {
    Done(RefinementResult),
    Continue {
        coordinate: GeoPoint,
        next_round: u32,
        distance_px: f64,
        density_score: usize,
    },
}

impl StepReport {
    pub fn done(&self) -> bool {
        matches!(self, StepReport::Done(_))
    }

    pub fn coordinate(&self) -> GeoPoint {
        match self {
            StepReport::Done(result) => result.coordinate,
            StepReport::Continue { coordinate, .. } => *coordinate,
        }
    }
}

enum Decision {
    Continue,
    Stop(Outcome, String),
}

#[derive(Debug)]
pub struct RefinementController {
    gateway: SegmentationGateway,
    selector: ZoneSelector,
    config: RefinementConfig,
    imager: Option<Arc<dyn CropImager>>,
}

impl RefinementController {
    pub fn new(gateway: SegmentationGateway, config: RefinementConfig) -> Self {
        Self {
            gateway,
            selector: config.selector(),
            config,
            imager: None,
        }
    }

    /// Captures a fresh crop for every round after the first.
    pub fn with_imager(mut self, imager: Arc<dyn CropImager>) -> Self {
        self.imager = Some(imager);
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    pub fn gateway(&self) -> &SegmentationGateway {
        &self.gateway
    }

    /// Validates the input and builds the initial state.
    pub fn start(&self, input: &RefinementInput) -> RefineResult<RefinementState> {
        self.validate_image(&input.image)?;
        if !input.anchor.is_finite()
            || input.anchor.lat.abs() > 90.0
            || input.anchor.lng.abs() > 180.0
        {
            return Err(RefineError::InvalidInput(format!(
                "anchor {:?} is not a valid coordinate",
                input.anchor
            )));
        }
        if input.zoom > MAX_ZOOM {
            return Err(RefineError::InvalidInput(format!(
                "zoom {} exceeds {MAX_ZOOM}",
                input.zoom
            )));
        }
        if input.crop_size == 0 {
            return Err(RefineError::InvalidInput(
                "crop size must be positive".to_string(),
            ));
        }

        Ok(RefinementState {
            round: 1,
            attempt: 0,
            anchor: input.anchor,
            origin: input.anchor,
            zoom: input.zoom,
            crop_size: input.crop_size,
            previous_density: 0,
            last_distance_px: None,
            phase: RefinementPhase::Init,
            outcome: None,
        })
    }

    fn validate_image(&self, image: &ImagePayload) -> RefineResult<()> {
        if image.len() < self.config.min_image_bytes {
            return Err(RefineError::InvalidInput(format!(
                "image payload has {} bytes, at least {} required",
                image.len(),
                self.config.min_image_bytes
            )));
        }
        Ok(())
    }

    /// Runs rounds until a stopping condition is met.
    pub async fn run(&self, input: RefinementInput) -> RefineResult<RefinementResult> {
        let mut state = self.start(&input)?;
        let mut image = input.image;

        loop {
            if let Some(result) = self.round(&mut state, &image).await? {
                return Ok(result);
            }
            if let Some(fresh) = self.recapture(&mut state).await? {
                image = fresh;
            }
        }
    }

    /// Captures the crop for the state's current anchor, if an imager is set.
    ///
    /// A failed or unusable capture moves the state to `Aborted`.
    pub async fn recapture(
        &self,
        state: &mut RefinementState,
    ) -> RefineResult<Option<ImagePayload>> {
        let Some(imager) = &self.imager else {
            return Ok(None);
        };

        let captured = imager
            .capture(&self.crop(state))
            .await
            .map_err(RefineError::from)
            .and_then(|image| self.validate_image(&image).map(|()| image));

        match captured {
            Ok(image) => Ok(Some(image)),
            Err(err) => {
                warn!(round = state.round, error = %err, "Crop capture aborted refinement");
                state.phase = RefinementPhase::Aborted;
                Err(err)
            }
        }
    }

    /// Runs exactly one round starting from the caller's coordinate.
    pub async fn step(&self, step: StepInput) -> RefineResult<StepReport> {
        if step.round == 0 {
            return Err(RefineError::InvalidInput(
                "round numbers start at 1".to_string(),
            ));
        }
        let mut state = self.start(&step.input)?;
        state.round = step.round;
        state.previous_density = step.previous_density;
        state.last_distance_px = step.previous_distance_px;

        match self.round(&mut state, &step.input.image).await? {
            Some(result) => Ok(StepReport::Done(result)),
            None => Ok(StepReport::Continue {
                coordinate: state.anchor,
                next_round: state.round,
                distance_px: state.last_distance_px.unwrap_or_default(),
                density_score: state.previous_density,
            }),
        }
    }

    fn crop(&self, state: &RefinementState) -> CropSpec {
        CropSpec::new(state.anchor, state.zoom, state.crop_size)
    }

    /// One detect/select/project/evaluate pass. `Some` when the loop is over.
    pub async fn round(
        &self,
        state: &mut RefinementState,
        image: &ImagePayload,
    ) -> RefineResult<Option<RefinementResult>> {
        let crop = self.crop(state);

        state.phase = RefinementPhase::AwaitingDetection;
        let selection = self.detect(state, &crop, image).await;

        state.phase = RefinementPhase::Evaluating;
        Ok(match selection {
            Some(selection) => self.evaluate(state, &crop, &selection),
            None => Some(self.no_detection(state)),
        })
    }

    /// Bounded attempt loop: empty detections and gateway failures both use
    /// up one attempt of the round's budget.
    async fn detect(
        &self,
        state: &mut RefinementState,
        crop: &CropSpec,
        image: &ImagePayload,
    ) -> Option<Selection> {
        state.attempt = 0;
        while state.attempt < self.config.max_attempts {
            state.attempt += 1;

            let request = SegmentationRequest::for_crop(image.clone(), crop);
            match self.gateway.submit(&request).await {
                Ok(zones) => match self.selector.select(&zones) {
                    Ok(selection) => return Some(selection),
                    Err(no_zone) => debug!(
                        round = state.round,
                        attempt = state.attempt,
                        candidates = no_zone.candidates,
                        "No relevant zone detected"
                    ),
                },
                Err(err) => warn!(
                    round = state.round,
                    attempt = state.attempt,
                    error = %err,
                    "Segmentation attempt failed"
                ),
            }
        }

        warn!(
            round = state.round,
            attempts = state.attempt,
            "Detection budget exhausted"
        );
        None
    }

    /// Applies the stopping rules to a round's selection.
    ///
    /// Order: round limit, distance tolerance, optional density plateau.
    pub fn evaluate(
        &self,
        state: &mut RefinementState,
        crop: &CropSpec,
        selection: &Selection,
    ) -> Option<RefinementResult> {
        let coordinate = crop.to_geo(selection.centroid);
        let distance_px = crop.distance_from_center(coordinate);
        let density = selection.density_score;
        let density_gain = density as i64 - state.previous_density as i64;

        state.previous_density = density;
        state.last_distance_px = Some(distance_px);
        state.anchor = coordinate;

        debug!(
            round = state.round,
            lat = coordinate.lat,
            lng = coordinate.lng,
            distance_px,
            density,
            "Round evaluated"
        );

        let decision = if state.round >= self.config.max_rounds {
            Decision::Stop(
                Outcome::Exhausted,
                format!(
                    "Stopped after {} rounds, {distance_px:.1} px from center",
                    state.round
                ),
            )
        } else if distance_px < self.config.center_tolerance_px {
            Decision::Stop(
                Outcome::Converged,
                format!(
                    "Converged after {} rounds, {distance_px:.1} px from center",
                    state.round
                ),
            )
        } else {
            match self.config.min_density_improvement {
                Some(min_gain) if density_gain < min_gain as i64 => Decision::Stop(
                    Outcome::Converged,
                    format!(
                        "Density gain {density_gain} below {min_gain} after {} rounds",
                        state.round
                    ),
                ),
                _ => Decision::Continue,
            }
        };

        match decision {
            Decision::Continue => {
                state.round += 1;
                state.phase = RefinementPhase::Continuing;
                None
            }
            Decision::Stop(outcome, message) => {
                state.phase = match outcome {
                    Outcome::Converged => RefinementPhase::Converged,
                    Outcome::Exhausted | Outcome::NoDetection => RefinementPhase::Exhausted,
                };
                state.outcome = Some(outcome);
                info!(?outcome, rounds = state.round, distance_px, "Refinement finished");

                Some(RefinementResult {
                    coordinate,
                    rounds: state.round,
                    final_distance_px: distance_px,
                    density_score: density,
                    outcome,
                    message,
                    zone_label: Some(selection.label),
                    zone_area_m2: Some(selection.area_px * crop.meters_per_pixel().powi(2)),
                })
            }
        }
    }

    fn no_detection(&self, state: &mut RefinementState) -> RefinementResult {
        state.phase = RefinementPhase::Exhausted;
        state.outcome = Some(Outcome::NoDetection);
        info!(
            rounds = state.round,
            lat = state.anchor.lat,
            lng = state.anchor.lng,
            "No site zone detected, keeping anchor"
        );

        RefinementResult {
            coordinate: state.anchor,
            rounds: state.round,
            final_distance_px: state.last_distance_px.unwrap_or_default(),
            density_score: 0,
            outcome: Outcome::NoDetection,
            message: format!(
                "No site zone detected in round {} after {} attempts",
                state.round, state.attempt
            ),
            zone_label: None,
            zone_area_m2: None,
        }
    }
}
