//! Spherical web-mercator projection between geographic coordinates and
//! crop-local pixels.
//!
//! A crop is a `crop_size × crop_size` window cut out of the global tile
//! pyramid at a given zoom, with its center pixel on the anchor coordinate.
//! Both directions go through global "world pixel" coordinates, so the
//! mapping is exact (up to f64 rounding) and not clipped at the crop edges.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Edge length of one tile of the pyramid, in pixels.
pub const TILE_SIZE: f64 = 256.0;

/// Latitude at which the mercator square ends.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Ground resolution at the equator for zoom 0, meters per pixel.
const EQUATOR_METERS_PER_PIXEL: f64 = 156_543.033_928_040_97;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

/// Crop geometry for one round. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropSpec {
    pub zoom: u8,
    pub crop_size: u32,
    pub anchor: GeoPoint,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    /// Great-circle distance in meters.
    pub fn haversine_m(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_008.8;

        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &PixelPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl CropSpec {
    pub fn new(anchor: GeoPoint, zoom: u8, crop_size: u32) -> Self {
        Self {
            zoom,
            crop_size,
            anchor,
        }
    }

    pub fn center(&self) -> PixelPoint {
        let half = f64::from(self.crop_size) / 2.0;
        PixelPoint::new(half, half)
    }

    pub fn to_pixel(&self, point: GeoPoint) -> PixelPoint {
        to_pixel(point, self.anchor, self.zoom, self.crop_size)
    }

    pub fn to_geo(&self, pixel: PixelPoint) -> GeoPoint {
        to_geo(pixel.x, pixel.y, self.anchor, self.zoom, self.crop_size)
    }

    /// Pixel distance between `point` and the crop center.
    pub fn distance_from_center(&self, point: GeoPoint) -> f64 {
        self.to_pixel(point).distance(&self.center())
    }

    pub fn meters_per_pixel(&self) -> f64 {
        meters_per_pixel(self.anchor.lat, self.zoom)
    }

    /// The same crop re-centered on `anchor`.
    pub fn recentered(&self, anchor: GeoPoint) -> Self {
        Self { anchor, ..*self }
    }
}

/// Width and height of the whole world at `zoom`, in pixels.
pub fn world_size(zoom: u8) -> f64 {
    TILE_SIZE * 2_f64.powi(i32::from(zoom))
}

/// Ground resolution at `lat`; shrinks with the cosine of latitude.
pub fn meters_per_pixel(lat: f64, zoom: u8) -> f64 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    EQUATOR_METERS_PER_PIXEL * lat.to_radians().cos() / 2_f64.powi(i32::from(zoom))
}

fn geo_to_world(point: GeoPoint, zoom: u8) -> PixelPoint {
    let size = world_size(zoom);
    let lat = point.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let sin_lat = lat.to_radians().sin();

    let x = (point.lng + 180.0) / 360.0 * size;
    let y = (0.5 - ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / (4.0 * PI)) * size;

    PixelPoint::new(x, y)
}

fn world_to_geo(pixel: PixelPoint, zoom: u8) -> GeoPoint {
    let size = world_size(zoom);
    let lng = pixel.x / size * 360.0 - 180.0;
    let n = PI - 2.0 * PI * pixel.y / size;
    let lat = n.sinh().atan().to_degrees();

    GeoPoint::new(lat, lng)
}

/// Pixel position of `point` inside a crop centered on `anchor`.
pub fn to_pixel(point: GeoPoint, anchor: GeoPoint, zoom: u8, crop_size: u32) -> PixelPoint {
    let half = f64::from(crop_size) / 2.0;
    let world_point = geo_to_world(point, zoom);
    let world_anchor = geo_to_world(anchor, zoom);

    PixelPoint::new(
        (world_point.x - world_anchor.x) + half,
        (world_point.y - world_anchor.y) + half,
    )
}

/// Inverse of [`to_pixel`] for the same anchor, zoom and crop size.
pub fn to_geo(px: f64, py: f64, anchor: GeoPoint, zoom: u8, crop_size: u32) -> GeoPoint {
    let half = f64::from(crop_size) / 2.0;
    let world_anchor = geo_to_world(anchor, zoom);

    world_to_geo(
        PixelPoint::new(world_anchor.x + (px - half), world_anchor.y + (py - half)),
        zoom,
    )
}

#[cfg(test)]
mod tests {
    use common::FloatExt;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    const CROP_SIZES: [u32; 5] = [256, 300, 512, 768, 1024];

    #[test]
    fn anchor_maps_to_crop_center() {
        let anchors = [
            GeoPoint::new(42.2415653023614, 11.7369164719456),
            GeoPoint::new(-33.8688, 151.2093),
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(64.1466, -21.9426),
        ];

        for anchor in anchors {
            for zoom in 10..=21 {
                for crop_size in CROP_SIZES {
                    let pixel = to_pixel(anchor, anchor, zoom, crop_size);
                    let half = f64::from(crop_size) / 2.0;
                    assert_eq!(pixel, PixelPoint::new(half, half));
                }
            }
        }
    }

    #[test]
    fn round_trip_random_points() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..1000 {
            let anchor = GeoPoint::new(
                rng.random_range(-80.0..80.0),
                rng.random_range(-179.0..179.0),
            );
            let point = GeoPoint::new(
                (anchor.lat + rng.random_range(-0.05..0.05)).clamp(-84.0, 84.0),
                anchor.lng + rng.random_range(-0.05..0.05),
            );
            let zoom = rng.random_range(14..=20);
            let crop_size = CROP_SIZES[rng.random_range(0..CROP_SIZES.len())];

            let pixel = to_pixel(point, anchor, zoom, crop_size);
            let back = to_geo(pixel.x, pixel.y, anchor, zoom, crop_size);

            assert!(
                back.lat.approximately_eq(point.lat) && back.lng.approximately_eq(point.lng),
                "round trip drifted: {point:?} -> {pixel:?} -> {back:?} (zoom {zoom}, crop {crop_size})"
            );
        }
    }

    #[test]
    fn round_trip_far_outside_crop() {
        let anchor = GeoPoint::new(41.8042856087636, 12.2954701062645);
        let point = GeoPoint::new(45.4642, 9.19);

        for zoom in 10..=21 {
            let pixel = to_pixel(point, anchor, zoom, 300);
            let back = to_geo(pixel.x, pixel.y, anchor, zoom, 300);
            assert!(back.lat.approximately_eq(point.lat));
            assert!(back.lng.approximately_eq(point.lng));
        }
    }

    #[test]
    fn north_is_up_and_east_is_right() {
        let crop = CropSpec::new(GeoPoint::new(42.0, 13.0), 18, 300);
        let center = crop.center();

        let north = crop.to_pixel(GeoPoint::new(42.0001, 13.0));
        let east = crop.to_pixel(GeoPoint::new(42.0, 13.0001));

        assert!(north.y < center.y);
        assert!(north.x.approximately_eq(center.x));
        assert!(east.x > center.x);
        assert!(east.y.approximately_eq(center.y));
    }

    #[test]
    fn zoom_step_doubles_pixel_offsets() {
        let anchor = GeoPoint::new(42.5033199747864, 13.6493309925818);
        let point = GeoPoint::new(42.5036, 13.6499);

        let at_18 = to_pixel(point, anchor, 18, 300);
        let at_19 = to_pixel(point, anchor, 19, 300);

        assert!(((at_19.x - 150.0) / (at_18.x - 150.0)).approximately_eq(2.0));
        assert!(((at_19.y - 150.0) / (at_18.y - 150.0)).approximately_eq(2.0));
    }

    #[test]
    fn horizontal_ground_distance_shrinks_with_latitude() {
        // A fixed eastward offset in meters covers more pixels away from the equator.
        let offset_m = 50.0;
        let pixels_at = |lat: f64| {
            let anchor = GeoPoint::new(lat, 10.0);
            let d_lng = offset_m / (111_320.0 * lat.to_radians().cos());
            let pixel = to_pixel(GeoPoint::new(lat, 10.0 + d_lng), anchor, 18, 300);
            pixel.x - 150.0
        };

        let equator = pixels_at(0.0);
        let sixty = pixels_at(60.0);
        assert!((sixty / equator).approximately_eq_within(2.0, 1e-3));

        assert!(meters_per_pixel(60.0, 18).approximately_eq_within(meters_per_pixel(0.0, 18) / 2.0, 1e-9));
    }

    #[test]
    fn polar_input_is_clamped_not_infinite() {
        let anchor = GeoPoint::new(89.99, 0.0);
        let pixel = to_pixel(GeoPoint::new(90.0, 0.0), anchor, 18, 300);
        assert!(pixel.x.is_finite() && pixel.y.is_finite());
    }

    #[test]
    fn haversine_matches_known_distance() {
        let rome = GeoPoint::new(41.9028, 12.4964);
        let milan = GeoPoint::new(45.4642, 9.19);
        let km = rome.haversine_m(&milan) / 1000.0;
        assert!(km.approximately_eq_within(477.0, 5.0), "{km}");
    }
}
