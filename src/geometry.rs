use geo::{Area, Centroid, LineString, Polygon};
use geo_types::{Coord, Point};
use rstar::AABB;
use serde::{Deserialize, Serialize};

/// Length of one degree of latitude (or of longitude at the equator) in meters
pub const METERS_PER_DEGREE: f64 = 111_319.9;

/// Below this absolute signed area (in square degrees) a ring is treated as degenerate
const MIN_RING_AREA: f64 = 1e-14;

/// Equirectangular distance in meters between two (lon, lat) points.
///
/// The longitude delta is scaled by the cosine of the mean latitude, which is
/// accurate enough for the few-hundred-meter spans segment matching works on.
pub fn distance(p1: Point<f64>, p2: Point<f64>) -> f64 {
    let mean_lat = ((p1.y() + p2.y()) / 2.0).to_radians();
    let dx = (p2.x() - p1.x()) * mean_lat.cos();
    let dy = p2.y() - p1.y();
    dx.hypot(dy) * METERS_PER_DEGREE
}

pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Converts meters to degrees of longitude at the given latitude
pub fn meters_to_lon_degrees(meters: f64, latitude: f64) -> f64 {
    // Clamp so a buffer near the poles stays finite
    let cos_lat = latitude.to_radians().cos().max(1e-6);
    meters / (METERS_PER_DEGREE * cos_lat)
}

/// Point at fraction `t` along the straight (lon, lat) vector from `a` to `b`
pub fn interpolate(a: Point<f64>, b: Point<f64>, t: f64) -> Point<f64> {
    Point::new(a.x() + (b.x() - a.x()) * t, a.y() + (b.y() - a.y()) * t)
}

/// Offset of `p` from `origin` in local meters (x east, y north).
pub(crate) fn local_offset(origin: Point<f64>, p: Point<f64>, cos_lat: f64) -> Coord<f64> {
    Coord {
        x: (p.x() - origin.x()) * cos_lat * METERS_PER_DEGREE,
        y: (p.y() - origin.y()) * METERS_PER_DEGREE,
    }
}

/// Centroid of an ordered vertex ring using the signed-area formula.
///
/// The ring does not need to be closed. Returns `None` for fewer than two
/// vertices or when the ring encloses no area.
pub fn polygon_centroid(points: &[Point<f64>]) -> Option<Point<f64>> {
    if points.len() < 2 {
        return None;
    }

    let ring: LineString<f64> = points.iter().map(|p| p.0).collect();
    let polygon = Polygon::new(ring, vec![]);

    if polygon.signed_area().abs() < MIN_RING_AREA {
        return None;
    }

    polygon.centroid()
}

/// Axis-aligned lat/lon box. `origin` holds the minimum corner and `extent`
/// the maximum corner, both as (lon, lat) points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub origin: Point<f64>,
    pub extent: Point<f64>,
}

impl Region {
    /// Builds a region from two opposite corners in any order
    pub fn new(a: Point<f64>, b: Point<f64>) -> Self {
        Self {
            origin: Point::new(a.x().min(b.x()), a.y().min(b.y())),
            extent: Point::new(a.x().max(b.x()), a.y().max(b.y())),
        }
    }

    /// Zero-area region covering a single point
    pub fn from_point(point: Point<f64>) -> Self {
        Self {
            origin: point,
            extent: point,
        }
    }

    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = Point<f64>>,
    {
        let mut iter = points.into_iter();
        let mut region = Self::from_point(iter.next()?);
        for point in iter {
            region.include_point(point);
        }
        Some(region)
    }

    pub fn min_lat(&self) -> f64 {
        self.origin.y()
    }

    pub fn min_lon(&self) -> f64 {
        self.origin.x()
    }

    pub fn max_lat(&self) -> f64 {
        self.extent.y()
    }

    pub fn max_lon(&self) -> f64 {
        self.extent.x()
    }

    pub fn center(&self) -> Point<f64> {
        interpolate(self.origin, self.extent, 0.5)
    }

    /// Boundaries are inclusive, so touching regions intersect
    pub fn intersects(&self, other: &Region) -> bool {
        self.min_lon() <= other.max_lon()
            && other.min_lon() <= self.max_lon()
            && self.min_lat() <= other.max_lat()
            && other.min_lat() <= self.max_lat()
    }

    pub fn contains_point(&self, point: Point<f64>) -> bool {
        point.x() >= self.min_lon()
            && point.x() <= self.max_lon()
            && point.y() >= self.min_lat()
            && point.y() <= self.max_lat()
    }

    /// Expands this region so it also covers `other`
    pub fn union_in_place(&mut self, other: &Region) {
        self.origin = Point::new(
            self.min_lon().min(other.min_lon()),
            self.min_lat().min(other.min_lat()),
        );
        self.extent = Point::new(
            self.max_lon().max(other.max_lon()),
            self.max_lat().max(other.max_lat()),
        );
    }

    pub fn include_point(&mut self, point: Point<f64>) {
        self.union_in_place(&Region::from_point(point));
    }

    /// Shrinks the region by `d_lat`/`d_lon` degrees on every side. Negative
    /// values grow it. A shrink past the center collapses that axis onto it.
    pub fn inset(&self, d_lat: f64, d_lon: f64) -> Region {
        let center = self.center();

        let (min_lat, max_lat) = if self.min_lat() + d_lat > self.max_lat() - d_lat {
            (center.y(), center.y())
        } else {
            (self.min_lat() + d_lat, self.max_lat() - d_lat)
        };
        let (min_lon, max_lon) = if self.min_lon() + d_lon > self.max_lon() - d_lon {
            (center.x(), center.x())
        } else {
            (self.min_lon() + d_lon, self.max_lon() - d_lon)
        };

        Region {
            origin: Point::new(min_lon, min_lat),
            extent: Point::new(max_lon, max_lat),
        }
    }

    /// Grows the region by `meters` on every side; the longitude buffer is
    /// corrected for the latitude of the region's center.
    pub fn buffered(&self, meters: f64) -> Region {
        let d_lat = meters_to_lat_degrees(meters);
        let d_lon = meters_to_lon_degrees(meters, self.center().y());
        self.inset(-d_lat, -d_lon)
    }

    pub fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners(
            [self.min_lon(), self.min_lat()],
            [self.max_lon(), self.max_lat()],
        )
    }
}
