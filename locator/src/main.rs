use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use common::log_setup::{setup_logging, LogOptions};
use tracing::info;

use locator::controller::RefinementController;
use locator::gateway::{AdmissionControl, HttpSegmentationBackend, SegmentationGateway};
use locator::imagery::{DirectoryImages, ImagePayload};
use locator::projection::GeoPoint;
use locator::service::{RefineRequest, RefinementService, StepRequest};
use locator::site_store::InMemorySiteStore;
use locator::LocatorConfig;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// YAML or JSON config; defaults apply when omitted
    #[arg(short, long)]
    config: Option<String>,
    /// YAML or JSON list of site records
    #[arg(long)]
    sites: String,
    /// Write refined coordinates back into the sites file
    #[arg(long)]
    save: bool,
    #[arg(long, required_unless_present = "all")]
    site: Option<String>,
    /// Crop image file, raw bytes or a base64 data URL
    #[arg(long, required_unless_present = "all")]
    image: Option<String>,
    /// Refine every site, reading `<site>.png|jpg|jpeg|b64` from `--image-dir`
    #[arg(long, conflicts_with_all = ["site", "image", "step"], requires = "image_dir")]
    all: bool,
    #[arg(long)]
    image_dir: Option<String>,
    #[arg(long)]
    zoom: Option<u8>,
    #[arg(long)]
    crop_size: Option<u32>,
    #[arg(long, requires = "lng")]
    lat: Option<f64>,
    #[arg(long, requires = "lat")]
    lng: Option<f64>,
    /// Run a single round with this 1-based number instead of the full loop
    #[arg(long)]
    step: Option<u32>,
    #[arg(long, default_value_t = 0)]
    previous_density: usize,
    /// `distance_px` reported by the previous step
    #[arg(long)]
    previous_distance: Option<f64>,
    #[arg(long)]
    log_level: Option<String>,
    /// Also write daily rolling log files into this directory
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => LocatorConfig::from_file(path)?,
        None => LocatorConfig::default(),
    };
    setup_logging(&LogOptions {
        level: cli.log_level.clone().unwrap_or_else(|| config.log_level.clone()),
        directory: cli.log_dir.clone().or_else(|| config.log_dir.clone()).map(Into::into),
        ..LogOptions::default()
    })?;

    let store = Arc::new(InMemorySiteStore::from_file(&cli.sites)?);
    info!(sites = store.len().await, path = %cli.sites, "Loaded site records");

    let backend = HttpSegmentationBackend::new(
        config.segmentation.endpoint.clone(),
        config.segmentation.timeout(),
    )?;
    let gateway = SegmentationGateway::new(
        Arc::new(backend),
        AdmissionControl::try_from(config.segmentation.max_concurrent)?,
        config.segmentation.timeout(),
    );
    let mut refinement = config.refinement.clone();
    if let Some(zoom) = cli.zoom {
        refinement.default_zoom = zoom;
    }
    if let Some(crop_size) = cli.crop_size {
        refinement.default_crop_size = crop_size;
    }
    let controller = RefinementController::new(gateway, refinement);
    let service = Arc::new(RefinementService::new(controller, store.clone()));

    let output = if cli.all {
        let Some(image_dir) = cli.image_dir.as_deref() else {
            bail!("--all needs --image-dir");
        };
        let reports = service
            .refine_all(Arc::new(DirectoryImages::new(image_dir)), &config.batch)
            .await?;
        serde_json::to_string_pretty(&reports)?
    } else {
        let (Some(site), Some(image)) = (cli.site.clone(), cli.image.as_deref()) else {
            bail!("--site and --image are required without --all");
        };
        let image = ImagePayload::read_file(image)
            .await
            .with_context(|| format!("Failed to load image {image}"))?;

        let request = RefineRequest {
            site_key: site.into(),
            zoom: cli.zoom,
            crop_size: cli.crop_size,
            image: Some(image),
            initial_coordinate: cli.lat.zip(cli.lng).map(|(lat, lng)| GeoPoint::new(lat, lng)),
        };

        match cli.step {
            Some(round) => {
                let report = service
                    .refine_step(StepRequest {
                        refine: request,
                        round,
                        previous_density: cli.previous_density,
                        previous_distance_px: cli.previous_distance,
                    })
                    .await?;
                serde_json::to_string_pretty(&report)?
            }
            None => serde_json::to_string_pretty(&service.refine(request).await?)?,
        }
    };
    println!("{output}");

    if cli.save {
        store.save(&cli.sites).await?;
        info!(path = %cli.sites, "Saved site records");
    }

    Ok(())
}
