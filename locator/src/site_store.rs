use std::fmt::{Debug, Display, Formatter};

use async_trait::async_trait;
use common::Shared;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::projection::GeoPoint;

/// Opaque site identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteKey(String);

impl SiteKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for SiteKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SiteKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for SiteKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub key: SiteKey,
    #[serde(default)]
    pub name: String,
    pub coordinate: GeoPoint,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Site store unavailable: {0}")]
    Unavailable(String),
    #[error("Site {0} not found")]
    NotFound(SiteKey),
    #[error("Site store failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence collaborator that owns site records.
#[async_trait]
pub trait SiteStore: Debug + Send + Sync {
    async fn fetch(&self, key: &SiteKey) -> StoreResult<Option<SiteRecord>>;
    async fn update_coordinate(&self, key: &SiteKey, coordinate: GeoPoint) -> StoreResult<()>;
    /// Every known site key, in ascending order.
    async fn list_keys(&self) -> StoreResult<Vec<SiteKey>>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySiteStore {
    sites: Shared<HashMap<SiteKey, SiteRecord>>,
}

impl InMemorySiteStore {
    pub fn with_sites(sites: impl IntoIterator<Item = SiteRecord>) -> Self {
        let sites = sites
            .into_iter()
            .map(|site| (site.key.clone(), site))
            .collect::<HashMap<_, _>>();
        Self {
            sites: Shared::new(sites),
        }
    }

    /// Loads a YAML or JSON list of site records.
    pub fn from_file(path: &str) -> common::SerdeFormatResult<Self> {
        let sites: Vec<SiteRecord> = common::deserialize_file(path)?;
        Ok(Self::with_sites(sites))
    }

    /// Writes all records back as YAML or JSON, sorted by key.
    pub async fn save(&self, path: &str) -> common::SerdeFormatResult<()> {
        let mut sites: Vec<SiteRecord> = self.sites.lock().await.values().cloned().collect();
        sites.sort_by(|a, b| a.key.cmp(&b.key));
        common::serialize_file(&sites, path)
    }

    pub async fn len(&self) -> usize {
        self.sites.lock().await.len()
    }

    /// Closest site to `point` by great-circle distance.
    pub async fn nearest(&self, point: GeoPoint) -> Option<SiteRecord> {
        let sites = self.sites.lock().await;
        sites
            .values()
            .min_by(|a, b| {
                a.coordinate
                    .haversine_m(&point)
                    .total_cmp(&b.coordinate.haversine_m(&point))
            })
            .cloned()
    }
}

#[async_trait]
impl SiteStore for InMemorySiteStore {
    async fn fetch(&self, key: &SiteKey) -> StoreResult<Option<SiteRecord>> {
        Ok(self.sites.lock().await.get(key).cloned())
    }

    async fn update_coordinate(&self, key: &SiteKey, coordinate: GeoPoint) -> StoreResult<()> {
        let mut sites = self.sites.lock().await;
        let site = sites
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        site.coordinate = coordinate;
        Ok(())
    }

    async fn list_keys(&self) -> StoreResult<Vec<SiteKey>> {
        let mut keys: Vec<SiteKey> = self.sites.lock().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
