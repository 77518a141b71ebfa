use geo::BoundingRect;
use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::PipelineError;

pub const MAX_ZOOM: u8 = 22;
/// Tile budget of one run unless configured otherwise.
pub const DEFAULT_MAX_TILES: u64 = 10_000;

// Web Mercator latitude limit
const MAX_LAT: f64 = 85.051129;
// Nudges the lower-right corner inside the bbox so shared edges don't add a tile
const LL_EPSILON: f64 = 1e-11;
const EPSILON: f64 = 1e-14;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileCoordinate {
    pub x: u32,
    pub y: u32,
    pub zoom: u8,
}

impl TileCoordinate {
    /// "z/x/y" key used in logs and failure reports.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.zoom, self.x, self.y)
    }
}

impl BoundingBox {
    /// Build a bbox, rejecting degenerate, non-finite or antimeridian-crossing input.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, PipelineError> {
        let bbox = Self {
            west,
            south,
            east,
            north,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let values = [self.west, self.south, self.east, self.north];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidBoundingBox(format!(
                "non-finite coordinate in {}",
                self.to_query_value()
            )));
        }
        if self.west < -180.0 || self.east > 180.0 || self.south < -90.0 || self.north > 90.0 {
            return Err(PipelineError::InvalidBoundingBox(format!(
                "coordinates out of range in {}",
                self.to_query_value()
            )));
        }
        if self.west > self.east {
            // Antimeridian crossing is not wrapped
            return Err(PipelineError::InvalidBoundingBox(format!(
                "west {} is east of east {} (antimeridian spans are unsupported)",
                self.west, self.east
            )));
        }
        if self.west == self.east || self.south >= self.north {
            return Err(PipelineError::InvalidBoundingBox(format!(
                "degenerate extent {}",
                self.to_query_value()
            )));
        }
        Ok(())
    }

    /// Bounds of the polygon handed over by the drawing layer.
    pub fn from_geometry(geometry: &Geometry<f64>) -> Result<Self, PipelineError> {
        let rect = geometry
            .bounding_rect()
            .ok_or_else(|| PipelineError::InvalidBoundingBox("empty geometry".into()))?;
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    /// "west,south,east,north" as the feature API expects it.
    pub fn to_query_value(&self) -> String {
        format!("{},{},{},{}", self.west, self.south, self.east, self.north)
    }

    pub fn contains_point(&self, lng: f64, lat: f64) -> bool {
        lng >= self.west && lng <= self.east && lat >= self.south && lat <= self.north
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(other.east < self.west
            || other.west > self.east
            || other.north < self.south
            || other.south > self.north)
    }
}

// Convert a tile X coordinate to longitude of its western edge
pub fn tile_x_to_lng(x: u32, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    (x as f64 / n) * 360.0 - 180.0
}

// Convert a tile Y coordinate to latitude of its northern edge
pub fn tile_y_to_lat(y: u32, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    let lat_rad = (PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan();
    lat_rad.to_degrees()
}

// Convert longitude to tile X coordinate, clamped to the grid
fn lng_to_tile_x(lng: f64, zoom: u8) -> u32 {
    let n = 2.0_f64.powi(zoom as i32);
    let x = lng / 360.0 + 0.5;
    clamp_to_grid(x, n)
}

// Convert latitude to tile Y coordinate, clamped to the grid
fn lat_to_tile_y(lat: f64, zoom: u8) -> u32 {
    let n = 2.0_f64.powi(zoom as i32);
    let sin_lat = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / PI;
    clamp_to_grid(y, n)
}

fn clamp_to_grid(fraction: f64, n: f64) -> u32 {
    if fraction <= 0.0 {
        0
    } else if fraction >= 1.0 {
        (n - 1.0) as u32
    } else {
        ((fraction + EPSILON) * n).floor() as u32
    }
}

/// Geographic extent of a single tile.
pub fn tile_bounds(tile: &TileCoordinate) -> BoundingBox {
    BoundingBox {
        west: tile_x_to_lng(tile.x, tile.zoom),
        south: tile_y_to_lat(tile.y + 1, tile.zoom),
        east: tile_x_to_lng(tile.x + 1, tile.zoom),
        north: tile_y_to_lat(tile.y, tile.zoom),
    }
}

// Inclusive tile ranges covering `bbox`, as (min_x, max_x, min_y, max_y)
fn tile_ranges(bbox: &BoundingBox, zoom: u8) -> Result<(u32, u32, u32, u32), PipelineError> {
    if zoom > MAX_ZOOM {
        return Err(PipelineError::InvalidZoom(zoom));
    }
    bbox.validate()?;

    let west = bbox.west.max(-180.0);
    let south = bbox.south.max(-MAX_LAT);
    let east = bbox.east.min(180.0);
    let north = bbox.north.min(MAX_LAT);

    // Note: y grows southwards in tile coordinates
    let min_x = lng_to_tile_x(west, zoom);
    let min_y = lat_to_tile_y(north, zoom);
    // A bbox thinner than the epsilon must still keep its own tile
    let max_x = lng_to_tile_x(east - LL_EPSILON, zoom).max(min_x);
    let max_y = lat_to_tile_y(south + LL_EPSILON, zoom).max(min_y);
    Ok((min_x, max_x, min_y, max_y))
}

/// Number of tiles covering `bbox` at `zoom`.
pub fn tile_count(bbox: &BoundingBox, zoom: u8) -> Result<u64, PipelineError> {
    let (min_x, max_x, min_y, max_y) = tile_ranges(bbox, zoom)?;
    let columns = u64::from(max_x - min_x) + 1;
    let rows = u64::from(max_y - min_y) + 1;
    columns
        .checked_mul(rows)
        .ok_or_else(|| PipelineError::InvalidBoundingBox(format!("tile count overflows at zoom {}", zoom)))
}

/// Every tile intersecting `bbox` at `zoom`, x outer and y inner, refusing
/// to build more than `max_tiles` of them.
pub fn tiles_within_limit(bbox: &BoundingBox, zoom: u8, max_tiles: u64) -> Result<Vec<TileCoordinate>, PipelineError> {
    let count = tile_count(bbox, zoom)?;
    if count > max_tiles {
        return Err(PipelineError::TooManyTiles {
            count,
            limit: max_tiles,
        });
    }

    let (min_x, max_x, min_y, max_y) = tile_ranges(bbox, zoom)?;
    let mut tiles = Vec::with_capacity(count as usize);
    for x in min_x..=max_x {
        for y in min_y..=max_y {
            tiles.push(TileCoordinate { x, y, zoom });
        }
    }
    Ok(tiles)
}

/// Every tile intersecting `bbox` at `zoom` within [`DEFAULT_MAX_TILES`].
pub fn tiles_for_bbox(bbox: &BoundingBox, zoom: u8) -> Result<Vec<TileCoordinate>, PipelineError> {
    tiles_within_limit(bbox, zoom, DEFAULT_MAX_TILES)
}

/// Split `bbox` into the extents of the tiles covering it.
pub fn decompose(bbox: &BoundingBox, zoom: u8) -> Result<Vec<BoundingBox>, PipelineError> {
    Ok(tiles_for_bbox(bbox, zoom)?.iter().map(tile_bounds).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo_types::polygon;

    fn scenario_bbox() -> BoundingBox {
        BoundingBox::new(34.78, 32.05, 34.80, 32.09).unwrap()
    }

    #[test]
    fn scenario_tile_grid_is_fixed() {
        let tiles = tiles_for_bbox(&scenario_bbox(), 18).unwrap();
        // 15 columns by 35 rows
        assert_eq!(tiles.len(), 525);
        assert_eq!(tiles[0], TileCoordinate { x: 156398, y: 106377, zoom: 18 });
        assert_eq!(tiles[1], TileCoordinate { x: 156398, y: 106378, zoom: 18 });
        assert_eq!(tiles[524], TileCoordinate { x: 156412, y: 106411, zoom: 18 });
    }

    #[test]
    fn decompose_is_deterministic() {
        let first = decompose(&scenario_bbox(), 16).unwrap();
        let second = decompose(&scenario_bbox(), 16).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 45);
    }

    #[test]
    fn tiny_bbox_yields_one_tile() {
        let bbox = BoundingBox::new(34.7801, 32.0501, 34.78011, 32.05011).unwrap();
        let parts = decompose(&bbox, 14).unwrap();
        assert_eq!(parts.len(), 1);
        let part = parts[0];
        assert!(part.west <= bbox.west && part.east >= bbox.east);
        assert!(part.south <= bbox.south && part.north >= bbox.north);
    }

    #[test]
    fn union_of_parts_covers_input() {
        let bbox = scenario_bbox();
        let parts = decompose(&bbox, 16).unwrap();
        let west = parts.iter().map(|b| b.west).fold(f64::INFINITY, f64::min);
        let east = parts.iter().map(|b| b.east).fold(f64::NEG_INFINITY, f64::max);
        let south = parts.iter().map(|b| b.south).fold(f64::INFINITY, f64::min);
        let north = parts.iter().map(|b| b.north).fold(f64::NEG_INFINITY, f64::max);
        assert!(west <= bbox.west && east >= bbox.east);
        assert!(south <= bbox.south && north >= bbox.north);

        // sample points inside the input all land in some part
        for i in 0..=10 {
            for j in 0..=10 {
                let lng = bbox.west + (bbox.east - bbox.west) * i as f64 / 10.0;
                let lat = bbox.south + (bbox.north - bbox.south) * j as f64 / 10.0;
                assert!(parts.iter().any(|p| p.contains_point(lng, lat)));
            }
        }
    }

    #[test]
    fn parts_are_exact_tile_footprints() {
        let tiles = tiles_for_bbox(&scenario_bbox(), 16).unwrap();
        for tile in &tiles {
            let part = tile_bounds(tile);
            // the part's centre maps back to the same tile
            let centre_lng = (part.west + part.east) / 2.0;
            let centre_lat = (part.south + part.north) / 2.0;
            assert_eq!(lng_to_tile_x(centre_lng, tile.zoom), tile.x);
            assert_eq!(lat_to_tile_y(centre_lat, tile.zoom), tile.y);
            assert!(part.intersects(&scenario_bbox()));
        }
    }

    #[test]
    fn tile_bounds_at_zoom_zero_cover_the_world() {
        let world = tile_bounds(&TileCoordinate { x: 0, y: 0, zoom: 0 });
        assert_relative_eq!(world.west, -180.0);
        assert_relative_eq!(world.east, 180.0);
        assert_relative_eq!(world.north, 85.0511287798, epsilon = 1e-9);
        assert_relative_eq!(world.south, -85.0511287798, epsilon = 1e-9);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            BoundingBox::new(34.8, 32.0, 34.7, 32.1),
            Err(PipelineError::InvalidBoundingBox(_))
        ));
        assert!(matches!(
            BoundingBox::new(34.7, 32.1, 34.8, 32.1),
            Err(PipelineError::InvalidBoundingBox(_))
        ));
        assert!(matches!(
            BoundingBox::new(f64::NAN, 32.0, 34.8, 32.1),
            Err(PipelineError::InvalidBoundingBox(_))
        ));
        // antimeridian span
        assert!(BoundingBox::new(179.5, -10.0, -179.5, 10.0).is_err());
        assert!(matches!(
            decompose(&scenario_bbox(), 23),
            Err(PipelineError::InvalidZoom(23))
        ));
    }

    #[test]
    fn bbox_from_drawn_polygon() {
        let poly: Geometry<f64> = polygon![
            (x: 34.78, y: 32.05),
            (x: 34.80, y: 32.06),
            (x: 34.79, y: 32.09),
        ]
        .into();
        let bbox = BoundingBox::from_geometry(&poly).unwrap();
        assert_eq!(bbox, scenario_bbox());
        assert_eq!(bbox.to_query_value(), "34.78,32.05,34.8,32.09");
    }

    #[test]
    fn oversized_request_is_refused_before_allocating() {
        let world = BoundingBox::new(-180.0, -85.0, 180.0, 85.0).unwrap();
        let count = tile_count(&world, 16).unwrap();
        assert!(count > 4_000_000_000);
        assert!(matches!(
            tiles_for_bbox(&world, 16),
            Err(PipelineError::TooManyTiles { count: c, limit: DEFAULT_MAX_TILES }) if c == count
        ));
        assert!(tiles_for_bbox(&world, 22).unwrap_err().is_fatal());
        // the same area is fine at a coarse zoom
        assert_eq!(tiles_for_bbox(&world, 2).unwrap().len(), 16);
    }

    #[test]
    fn limit_is_configurable() {
        assert!(tiles_within_limit(&scenario_bbox(), 18, 524).is_err());
        assert_eq!(tiles_within_limit(&scenario_bbox(), 18, 525).unwrap().len(), 525);
    }

    #[test]
    fn sliver_on_a_tile_edge_keeps_one_tile() {
        // narrower than the corner epsilon, starting exactly on a tile edge
        let bbox = BoundingBox::new(0.0, 10.0, 5e-12, 10.5).unwrap();
        let tiles = tiles_for_bbox(&bbox, 10).unwrap();
        assert!(!tiles.is_empty());
        assert!(tiles.iter().all(|t| t.x == 512));
        assert_eq!(tile_count(&bbox, 10).unwrap(), tiles.len() as u64);

        let flat = BoundingBox::new(10.0, -5e-12, 10.5, 0.0).unwrap();
        let tiles = tiles_for_bbox(&flat, 10).unwrap();
        assert!(tiles.iter().all(|t| t.y == 512));
        assert!(!tiles.is_empty());
    }
}
