//! Caller-facing refinement operations on top of the site store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::BatchConfig;
use crate::controller::{
    Outcome, RefineError, RefineResult, RefinementController, RefinementInput, RefinementResult,
    StepInput, StepReport,
};
use crate::imagery::{ImagePayload, SiteImageSource};
use crate::projection::{CropSpec, GeoPoint};
use crate::site_store::{SiteKey, SiteStore};

common::id_type!(RunId);

#[derive(Debug, Clone)]
pub struct RefineRequest {
    pub site_key: SiteKey,
    pub zoom: Option<u8>,
    pub crop_size: Option<u32>,
    pub image: Option<ImagePayload>,
    /// Starting coordinate; read from the site store when absent.
    pub initial_coordinate: Option<GeoPoint>,
}

impl RefineRequest {
    pub fn new(site_key: impl Into<SiteKey>, image: ImagePayload) -> Self {
        Self {
            site_key: site_key.into(),
            zoom: None,
            crop_size: None,
            image: Some(image),
            initial_coordinate: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRequest {
    pub refine: RefineRequest,
    /// 1-based round of this call.
    pub round: u32,
    pub previous_density: usize,
    /// `distance_px` of the previous step's report.
    pub previous_distance_px: Option<f64>,
}

/// Outcome of one site in a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteReport {
    pub site: SiteKey,
    /// Steps started for this site, including a failed one.
    pub steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RefinementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RefinementService {
    controller: RefinementController,
    store: Arc<dyn SiteStore>,
}

impl RefinementService {
    pub fn new(controller: RefinementController, store: Arc<dyn SiteStore>) -> Self {
        Self { controller, store }
    }

    pub fn controller(&self) -> &RefinementController {
        &self.controller
    }

    /// Runs the whole loop. The store is only written when the run converges.
    pub async fn refine(&self, request: RefineRequest) -> RefineResult<RefinementResult> {
        let run_id = RunId::unique();
        let span = info_span!("refine", site = %request.site_key, run = %run_id);

        async move {
            let site_key = request.site_key.clone();
            let input = self.resolve(request).await?;
            let result = self.controller.run(input).await?;

            if result.outcome == Outcome::Converged {
                self.persist(&site_key, result).await
            } else {
                info!(outcome = ?result.outcome, "Coordinate left unchanged in store");
                Ok(result)
            }
        }
        .instrument(span)
        .await
    }

    /// Runs one round and always writes the resulting coordinate.
    pub async fn refine_step(&self, request: StepRequest) -> RefineResult<StepReport> {
        let run_id = RunId::unique();
        let span = info_span!(
            "refine_step",
            site = %request.refine.site_key,
            run = %run_id,
            round = request.round
        );

        async move {
            let site_key = request.refine.site_key.clone();
            let input = self.resolve(request.refine).await?;
            let report = self
                .controller
                .step(StepInput {
                    input,
                    round: request.round,
                    previous_density: request.previous_density,
                    previous_distance_px: request.previous_distance_px,
                })
                .await?;

            if let Err(source) = self
                .store
                .update_coordinate(&site_key, report.coordinate())
                .await
            {
                error!(error = %source, "Failed to store step coordinate");
                return match report {
                    StepReport::Done(result) => Err(RefineError::Persistence {
                        result: Box::new(result),
                        source,
                    }),
                    StepReport::Continue { .. } => Err(RefineError::Store(source)),
                };
            }

            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Refines every stored site by stepping each one until it is done.
    ///
    /// Sites run in parallel up to `max_parallel_sites`; all of them share the
    /// gateway's admission control. A failing site is reported, not fatal.
    pub async fn refine_all(
        self: &Arc<Self>,
        images: Arc<dyn SiteImageSource>,
        batch: &BatchConfig,
    ) -> RefineResult<Vec<SiteReport>> {
        let keys = self.store.list_keys().await?;
        info!(sites = keys.len(), parallel = batch.max_parallel_sites, "Starting batch refinement");

        let slots = Arc::new(Semaphore::new(batch.max_parallel_sites.max(1)));
        let step_timeout = batch.step_timeout();

        let handles = keys
            .into_iter()
            .map(|site| {
                let service = Arc::clone(self);
                let images = Arc::clone(&images);
                let slots = Arc::clone(&slots);
                let task_site = site.clone();
                let handle = tokio::spawn(async move {
                    let _slot = slots.acquire_owned().await.ok();
                    service
                        .refine_site(&task_site, images.as_ref(), step_timeout)
                        .await
                });
                (site, handle)
            })
            .collect::<Vec<_>>();

        let mut reports = Vec::with_capacity(handles.len());
        for (site, handle) in handles {
            let report = handle.await.unwrap_or_else(|err| {
                error!(site = %site, error = %err, "Site refinement task failed");
                SiteReport {
                    site,
                    steps: 0,
                    result: None,
                    error: Some(err.to_string()),
                }
            });
            reports.push(report);
        }

        let failed = reports.iter().filter(|report| report.error.is_some()).count();
        info!(sites = reports.len(), failed, "Batch refinement finished");
        Ok(reports)
    }

    async fn refine_site(
        &self,
        site: &SiteKey,
        images: &dyn SiteImageSource,
        step_timeout: Duration,
    ) -> SiteReport {
        let mut steps = 0;
        let outcome = self
            .step_until_done(site, images, step_timeout, &mut steps)
            .instrument(info_span!("refine_site", site = %site))
            .await;

        match outcome {
            Ok(result) => SiteReport {
                site: site.clone(),
                steps,
                result: Some(result),
                error: None,
            },
            Err(err) => {
                warn!(site = %site, steps, error = %err, "Site refinement failed");
                SiteReport {
                    site: site.clone(),
                    steps,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn step_until_done(
        &self,
        site: &SiteKey,
        images: &dyn SiteImageSource,
        step_timeout: Duration,
        steps: &mut u32,
    ) -> RefineResult<RefinementResult> {
        let mut anchor = self
            .store
            .fetch(site)
            .await?
            .ok_or_else(|| RefineError::SiteNotFound(site.clone()))?
            .coordinate;
        let config = self.controller.config();
        let (zoom, crop_size) = (config.default_zoom, config.default_crop_size);

        let mut round = 1;
        let mut previous_density = 0;
        let mut previous_distance_px = None;
        loop {
            *steps += 1;
            let step = async {
                let image = images
                    .image_for(site, &CropSpec::new(anchor, zoom, crop_size))
                    .await?;
                self.refine_step(StepRequest {
                    refine: RefineRequest {
                        site_key: site.clone(),
                        zoom: Some(zoom),
                        crop_size: Some(crop_size),
                        image: Some(image),
                        initial_coordinate: Some(anchor),
                    },
                    round,
                    previous_density,
                    previous_distance_px,
                })
                .await
            };

            let report = tokio::time::timeout(step_timeout, step)
                .await
                .map_err(|_| RefineError::StepTimeout {
                    round,
                    after: step_timeout,
                })??;

            match report {
                StepReport::Done(result) => return Ok(result),
                StepReport::Continue {
                    coordinate,
                    next_round,
                    distance_px,
                    density_score,
                } => {
                    anchor = coordinate;
                    round = next_round;
                    previous_density = density_score;
                    previous_distance_px = Some(distance_px);
                }
            }
        }
    }

    async fn resolve(&self, request: RefineRequest) -> RefineResult<RefinementInput> {
        if request.site_key.is_blank() {
            return Err(RefineError::InvalidInput("site key is missing".to_string()));
        }
        let image = request
            .image
            .ok_or_else(|| RefineError::InvalidInput("image payload is missing".to_string()))?;

        let anchor = match request.initial_coordinate {
            Some(coordinate) => coordinate,
            None => {
                self.store
                    .fetch(&request.site_key)
                    .await?
                    .ok_or_else(|| RefineError::SiteNotFound(request.site_key.clone()))?
                    .coordinate
            }
        };

        let config = self.controller.config();
        Ok(RefinementInput {
            anchor,
            zoom: request.zoom.unwrap_or(config.default_zoom),
            crop_size: request.crop_size.unwrap_or(config.default_crop_size),
            image,
        })
    }

    async fn persist(
        &self,
        site_key: &SiteKey,
        result: RefinementResult,
    ) -> RefineResult<RefinementResult> {
        match self
            .store
            .update_coordinate(site_key, result.coordinate)
            .await
        {
            Ok(()) => {
                info!(
                    lat = result.coordinate.lat,
                    lng = result.coordinate.lng,
                    "Stored refined coordinate"
                );
                Ok(result)
            }
            Err(source) => {
                error!(error = %source, ?result, "Failed to store refined coordinate");
                Err(RefineError::Persistence {
                    result: Box::new(result),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use std::sync::atomic::Ordering;

    use crate::config::RefinementConfig;
    use crate::gateway::testing::{admission, ScriptedBackend};
    use crate::gateway::{AdmissionControl, GatewayResult, SegmentationGateway};
    use crate::imagery::{ImageError, ImageResult};
    use crate::projection::PixelPoint;
    use crate::site_store::{InMemorySiteStore, SiteRecord, StoreError, StoreResult};
    use crate::zone::{square_zone, Zone, ZoneLabel};

    const KEY: &str = "DJ001384641";

    fn origin() -> GeoPoint {
        GeoPoint::new(42.6556279552538, 13.9888505400184)
    }

    fn store() -> Arc<InMemorySiteStore> {
        Arc::new(InMemorySiteStore::with_sites([SiteRecord {
            key: KEY.into(),
            name: "ROSETO".to_string(),
            coordinate: origin(),
        }]))
    }

    fn stall_at(dx: f64) -> GatewayResult<Vec<Zone>> {
        Ok(vec![square_zone(
            ZoneLabel::PrimaryEquipmentStall,
            PixelPoint::new(150.0 + dx, 150.0),
            10.0,
        )])
    }

    fn service(
        script: Vec<GatewayResult<Vec<Zone>>>,
        store: Arc<dyn SiteStore>,
    ) -> RefinementService {
        let gateway = SegmentationGateway::new(
            Arc::new(ScriptedBackend::new(script)),
            AdmissionControl::default(),
            Duration::from_secs(2),
        );
        RefinementService::new(
            RefinementController::new(gateway, RefinementConfig::default()),
            store,
        )
    }

    fn request() -> RefineRequest {
        RefineRequest::new(KEY, ImagePayload::from_bytes(vec![1; 400]))
    }

    #[derive(Debug)]
    struct ReadOnlyStore(InMemorySiteStore);

    #[async_trait]
    impl SiteStore for ReadOnlyStore {
        async fn fetch(&self, key: &SiteKey) -> StoreResult<Option<SiteRecord>> {
            self.0.fetch(key).await
        }

        async fn update_coordinate(&self, _: &SiteKey, _: GeoPoint) -> StoreResult<()> {
            Err(StoreError::Unavailable("read-only replica".to_string()))
        }

        async fn list_keys(&self) -> StoreResult<Vec<SiteKey>> {
            self.0.list_keys().await
        }
    }

    #[tokio::test]
    async fn converged_result_is_written() -> anyhow::Result<()> {
        common::log_setup::setup_test_logging();
        let store = store();
        let service = service(vec![stall_at(40.0), stall_at(2.0)], store.clone());

        let result = service.refine(request()).await?;

        assert_eq!(result.outcome, Outcome::Converged);
        let stored = store.fetch(&KEY.into()).await?.unwrap();
        assert_eq!(stored.coordinate, result.coordinate);
        assert_ne!(stored.coordinate, origin());
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_and_no_detection_leave_store_untouched() -> anyhow::Result<()> {
        let store = store();
        let silent = service(vec![], store.clone());
        let result = silent.refine(request()).await?;
        assert_eq!(result.outcome, Outcome::NoDetection);
        assert_eq!(result.coordinate, origin());

        let script = (0..5).map(|_| stall_at(25.0)).collect();
        let drifting = service(script, store.clone());
        let result = drifting.refine(request()).await?;
        assert_eq!(result.outcome, Outcome::Exhausted);

        assert_eq!(store.fetch(&KEY.into()).await?.unwrap().coordinate, origin());
        Ok(())
    }

    #[tokio::test]
    async fn initial_coordinate_overrides_store() -> anyhow::Result<()> {
        let elsewhere = GeoPoint::new(42.7505753921479, 12.725623978618);
        let service = service(vec![stall_at(0.0)], store());

        let mut request = request();
        request.initial_coordinate = Some(elsewhere);
        request.zoom = Some(19);
        request.crop_size = Some(512);
        let result = service.refine(request).await?;

        // stall sits at (150, 150) in a 512 px crop, ~150 px off center
        let crop = CropSpec::new(elsewhere, 19, 512);
        assert!(crop.distance_from_center(result.coordinate) > 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_site_and_missing_inputs() {
        let service = service(vec![], store());

        let mut unknown = request();
        unknown.site_key = "nope".into();
        assert!(matches!(
            service.refine(unknown).await,
            Err(RefineError::SiteNotFound(key)) if key.as_str() == "nope"
        ));

        let mut blank = request();
        blank.site_key = " ".into();
        assert!(matches!(
            service.refine(blank).await,
            Err(RefineError::InvalidInput(_))
        ));

        let mut no_image = request();
        no_image.image = None;
        assert!(matches!(
            service.refine(no_image).await,
            Err(RefineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn persistence_failure_keeps_the_result() {
        let store = Arc::new(ReadOnlyStore(InMemorySiteStore::with_sites([SiteRecord {
            key: KEY.into(),
            name: String::new(),
            coordinate: origin(),
        }])));
        let service = service(vec![stall_at(1.0)], store);

        match service.refine(request()).await {
            Err(RefineError::Persistence { result, source }) => {
                assert_eq!(result.outcome, Outcome::Converged);
                assert_eq!(result.rounds, 1);
                assert!(matches!(source, StoreError::Unavailable(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn steps_write_every_round() -> anyhow::Result<()> {
        let store = store();
        let service = service(vec![stall_at(60.0), stall_at(5.0)], store.clone());

        let first = service
            .refine_step(StepRequest {
                refine: request(),
                round: 1,
                previous_density: 0,
                previous_distance_px: None,
            })
            .await?;
        assert!(!first.done());
        let stored = store.fetch(&KEY.into()).await?.unwrap().coordinate;
        assert_eq!(stored, first.coordinate());

        let StepReport::Continue {
            coordinate,
            next_round,
            distance_px,
            density_score,
        } = first
        else {
            panic!("expected continue");
        };
        let mut next = request();
        next.initial_coordinate = Some(coordinate);
        let second = service
            .refine_step(StepRequest {
                refine: next,
                round: next_round,
                previous_density: density_score,
                previous_distance_px: Some(distance_px),
            })
            .await?;

        assert!(second.done());
        assert_eq!(
            store.fetch(&KEY.into()).await?.unwrap().coordinate,
            second.coordinate()
        );
        Ok(())
    }

    /// Same image for every site except the listed ones.
    #[derive(Debug, Default)]
    struct FixedImages {
        missing: Vec<SiteKey>,
    }

    #[async_trait]
    impl SiteImageSource for FixedImages {
        async fn image_for(&self, site: &SiteKey, _: &CropSpec) -> ImageResult<ImagePayload> {
            if self.missing.contains(site) {
                return Err(ImageError::Missing(site.clone()));
            }
            Ok(ImagePayload::from_bytes(vec![1; 400]))
        }
    }

    fn sites(count: usize) -> Arc<InMemorySiteStore> {
        Arc::new(InMemorySiteStore::with_sites((0..count).map(|index| {
            SiteRecord {
                key: format!("DJ00138{index:04}").into(),
                name: String::new(),
                coordinate: GeoPoint::new(42.0 + index as f64 * 0.01, 13.4),
            }
        })))
    }

    fn batch_service(
        backend: Arc<ScriptedBackend>,
        ceiling: AdmissionControl,
        store: Arc<dyn SiteStore>,
    ) -> Arc<RefinementService> {
        let gateway = SegmentationGateway::new(backend, ceiling, Duration::from_secs(5));
        Arc::new(RefinementService::new(
            RefinementController::new(gateway, RefinementConfig::default()),
            store,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_keeps_segmentation_under_the_ceiling() -> anyhow::Result<()> {
        let backend = Arc::new(ScriptedBackend::new(vec![]).with_delay(Duration::from_millis(20)));
        let ceiling = admission(2);
        let service = batch_service(backend.clone(), ceiling.clone(), sites(6));
        let batch = BatchConfig {
            max_parallel_sites: 6,
            ..BatchConfig::default()
        };

        let reports = service
            .refine_all(Arc::new(FixedImages::default()), &batch)
            .await?;

        assert_eq!(reports.len(), 6);
        for report in &reports {
            assert_eq!(report.error, None);
            assert_eq!(report.steps, 1);
            let outcome = report.result.as_ref().map(|result| result.outcome);
            assert_eq!(outcome, Some(Outcome::NoDetection));
        }
        assert_eq!(backend.call_count(), 12);
        assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(ceiling.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn batch_reports_failing_sites_and_stores_the_rest() -> anyhow::Result<()> {
        let store = sites(3);
        let script = (0..2).map(|_| stall_at(2.0)).collect();
        let service = batch_service(
            Arc::new(ScriptedBackend::new(script)),
            admission(4),
            store.clone(),
        );
        let images = FixedImages {
            missing: vec!["DJ001380001".into()],
        };

        let reports = service
            .refine_all(Arc::new(images), &BatchConfig::default())
            .await?;

        let keys: Vec<&str> = reports.iter().map(|report| report.site.as_str()).collect();
        assert_eq!(keys, ["DJ001380000", "DJ001380001", "DJ001380002"]);

        let missing = &reports[1];
        assert!(missing.result.is_none());
        assert!(missing.error.as_deref().is_some_and(|err| err.contains("No image")));
        let untouched = store.fetch(&"DJ001380001".into()).await?.unwrap();
        assert_eq!(untouched.coordinate, GeoPoint::new(42.0 + 0.01, 13.4));

        for report in [&reports[0], &reports[2]] {
            let result = report.result.as_ref().expect("converged site");
            assert_eq!(result.outcome, Outcome::Converged);
            let stored = store.fetch(&report.site).await?.unwrap();
            assert_eq!(stored.coordinate, result.coordinate);
        }
        Ok(())
    }

    #[tokio::test]
    async fn slow_steps_trip_the_watchdog() -> anyhow::Result<()> {
        let backend = Arc::new(ScriptedBackend::new(vec![]).with_delay(Duration::from_secs(3)));
        let service = batch_service(backend, admission(4), sites(1));
        let batch = BatchConfig {
            step_timeout_secs: 1,
            ..BatchConfig::default()
        };

        let reports = service
            .refine_all(Arc::new(FixedImages::default()), &batch)
            .await?;

        assert_eq!(reports.len(), 1);
        assert!(reports[0].result.is_none());
        assert!(reports[0]
            .error
            .as_deref()
            .is_some_and(|err| err.contains("did not finish")));
        Ok(())
    }
}
