use std::str::FromStr;

use geo::{Area, Centroid, Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::projection::{CropSpec, GeoPoint, PixelPoint};

/// Site-feature classes produced by the segmentation model.
///
/// `Display` gives the kebab-case name; parsing also accepts the class names
/// the segmentation service emits.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ZoneLabel {
    #[strum(to_string = "primary-equipment-stall", serialize = "Stalli AT")]
    #[serde(alias = "Stalli AT")]
    PrimaryEquipmentStall,
    #[strum(to_string = "equipment-room", serialize = "Locale AT/MT")]
    #[serde(alias = "Locale AT/MT")]
    EquipmentRoom,
    #[strum(to_string = "parking", serialize = "Parcheggio")]
    #[serde(alias = "Parcheggio")]
    Parking,
    #[strum(to_string = "open-area", serialize = "Zona libera/Verde")]
    #[serde(alias = "Zona libera/Verde")]
    OpenArea,
    #[strum(to_string = "arrival-point", serialize = "arrivo AT")]
    #[serde(alias = "arrivo AT")]
    ArrivalPoint,
    #[strum(to_string = "road", serialize = "Strada")]
    #[serde(alias = "Strada")]
    Road,
    #[strum(to_string = "background")]
    Background,
}

impl ZoneLabel {
    /// Parses a label as sent by the segmentation service.
    pub fn from_wire(label: &str) -> Option<ZoneLabel> {
        ZoneLabel::from_str(label.trim()).ok()
    }

    /// The two classes that indicate the site itself.
    pub fn site_relevant() -> Vec<ZoneLabel> {
        vec![ZoneLabel::PrimaryEquipmentStall, ZoneLabel::EquipmentRoom]
    }
}

/// A labeled polygon in crop-pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub label: ZoneLabel,
    pub vertices: Vec<PixelPoint>,
}

impl Zone {
    pub fn new(label: ZoneLabel, vertices: Vec<PixelPoint>) -> Self {
        Self { label, vertices }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of vertices after dropping consecutive repeats and an explicit
    /// closing vertex.
    pub fn distinct_vertex_count(&self) -> usize {
        let mut count = 0;
        let mut previous: Option<&PixelPoint> = None;
        for vertex in &self.vertices {
            if previous != Some(vertex) {
                count += 1;
            }
            previous = Some(vertex);
        }
        if count > 1 && self.vertices.first() == self.vertices.last() {
            count -= 1;
        }
        count
    }

    pub fn has_enough_vertices(&self) -> bool {
        self.distinct_vertex_count() >= 3
    }

    pub fn polygon(&self) -> Polygon<f64> {
        let ring: Vec<Coord<f64>> = self
            .vertices
            .iter()
            .map(|vertex| Coord {
                x: vertex.x,
                y: vertex.y,
            })
            .collect();
        Polygon::new(LineString::from(ring), vec![])
    }

    /// Unsigned area in square pixels; 0 for fewer than 3 distinct vertices.
    pub fn area(&self) -> f64 {
        if !self.has_enough_vertices() {
            return 0.0;
        }
        let area = self.polygon().unsigned_area();
        if area.is_finite() {
            area
        } else {
            0.0
        }
    }

    /// `false` for polygons that would break centroid arithmetic.
    pub fn is_valid(&self) -> bool {
        self.vertices
            .iter()
            .all(|vertex| vertex.x.is_finite() && vertex.y.is_finite())
            && self.area() > common::EPSILON
    }

    /// Area-weighted centroid. `None` for degenerate polygons.
    pub fn centroid(&self) -> Option<PixelPoint> {
        if !self.is_valid() {
            return None;
        }
        self.polygon()
            .centroid()
            .map(|point| PixelPoint::new(point.x(), point.y()))
    }

    pub fn to_geo_ring(&self, crop: &CropSpec) -> Vec<GeoPoint> {
        self.vertices
            .iter()
            .map(|vertex| crop.to_geo(*vertex))
            .collect()
    }

    /// Approximate ground area using the crop's ground resolution.
    pub fn ground_area_m2(&self, crop: &CropSpec) -> f64 {
        self.area() * crop.meters_per_pixel().powi(2)
    }
}

/// Drops zones that cannot take part in geometric computation.
pub fn retain_valid(zones: Vec<Zone>) -> Vec<Zone> {
    zones
        .into_iter()
        .filter(|zone| zone.label != ZoneLabel::Background && zone.is_valid())
        .collect()
}

#[cfg(test)]
pub(crate) fn square_zone(label: ZoneLabel, center: PixelPoint, half: f64) -> Zone {
    Zone::new(
        label,
        vec![
            PixelPoint::new(center.x - half, center.y - half),
            PixelPoint::new(center.x + half, center.y - half),
            PixelPoint::new(center.x + half, center.y + half),
            PixelPoint::new(center.x - half, center.y + half),
        ],
    )
}
