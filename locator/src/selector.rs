use geo::{BooleanOps, Centroid, MultiPolygon};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::projection::PixelPoint;
use crate::zone::{Zone, ZoneLabel};

/// How the representative point is derived from the relevant zones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Centroid of the single largest relevant zone.
    #[default]
    LargestArea,
    /// Centroid of the union of every relevant zone.
    UnionCentroid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No relevant zone among {candidates} detected zones")]
pub struct NoRelevantZone {
    pub candidates: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub centroid: PixelPoint,
    /// Vertex count of the selected polygon (summed over zones for a union).
    pub density_score: usize,
    pub area_px: f64,
    /// Label of the chosen zone; the largest contributor for a union.
    pub label: ZoneLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSelector {
    pub relevant_labels: Vec<ZoneLabel>,
    pub policy: SelectionPolicy,
}

impl Default for ZoneSelector {
    fn default() -> Self {
        Self {
            relevant_labels: ZoneLabel::site_relevant(),
            policy: SelectionPolicy::default(),
        }
    }
}

impl ZoneSelector {
    pub fn new(relevant_labels: Vec<ZoneLabel>, policy: SelectionPolicy) -> Self {
        Self {
            relevant_labels,
            policy,
        }
    }

    pub fn is_relevant(&self, zone: &Zone) -> bool {
        self.relevant_labels.contains(&zone.label)
    }

    /// Relevant, geometrically valid zones in input order.
    pub fn relevant<'a>(&self, zones: &'a [Zone]) -> Vec<&'a Zone> {
        zones
            .iter()
            .filter(|zone| self.is_relevant(zone) && zone.is_valid())
            .collect()
    }

    pub fn select(&self, zones: &[Zone]) -> Result<Selection, NoRelevantZone> {
        let candidates = self.relevant(zones);
        let no_zone = NoRelevantZone {
            candidates: zones.len(),
        };

        let selection = match self.policy {
            SelectionPolicy::LargestArea => largest_area(&candidates),
            SelectionPolicy::UnionCentroid => union_centroid(&candidates),
        }
        .ok_or(no_zone)?;

        debug!(
            policy = ?self.policy,
            relevant = candidates.len(),
            area_px = selection.area_px,
            density = selection.density_score,
            "Selected site zone"
        );

        Ok(selection)
    }
}

fn largest_area(candidates: &[&Zone]) -> Option<Selection> {
    let mut best: Option<(&Zone, f64)> = None;
    for zone in candidates.iter().copied() {
        let area = zone.area();
        // strict comparison keeps the first of equal areas
        match best {
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((zone, area)),
        }
    }

    let (zone, area_px) = best?;
    Some(Selection {
        centroid: zone.centroid()?,
        density_score: zone.vertex_count(),
        area_px,
        label: zone.label,
    })
}

fn union_centroid(candidates: &[&Zone]) -> Option<Selection> {
    let label = largest_area(candidates)?.label;

    let union = candidates
        .iter()
        .map(|zone| MultiPolygon::new(vec![zone.polygon()]))
        .reduce(|merged, next| merged.union(&next))?;

    let area_px = geo::Area::unsigned_area(&union);
    if area_px <= common::EPSILON {
        return None;
    }
    let centroid = union.centroid()?;

    Some(Selection {
        centroid: PixelPoint::new(centroid.x(), centroid.y()),
        density_score: candidates.iter().map(|zone| zone.vertex_count()).sum(),
        area_px,
        label,
    })
}
