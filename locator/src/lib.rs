pub mod config;
pub mod controller;
pub mod gateway;
pub mod imagery;
pub mod projection;
pub mod selector;
pub mod service;
pub mod site_store;
pub mod zone;

pub use config::LocatorConfig;
pub use controller::{Outcome, RefineError, RefinementController, RefinementResult, StepReport};
pub use service::{RefineRequest, RefinementService, RunId, SiteReport, StepRequest};
