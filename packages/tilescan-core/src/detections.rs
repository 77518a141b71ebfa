//! Decoding of detection polygons delivered as Mapbox Vector Tiles.
//!
//! The detections endpoint ships each polygon as a one-feature vector tile
//! whose coordinates live on a fixed 4096-unit grid laid over the source
//! image. Only the outer ring is recovered; holes are dropped.
//!
//! The `*_text` entry points take the base64 string found in the JSON
//! response. The byte entry points take the tile itself, optionally gzipped,
//! and never try to read it as text.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use geozero::mvt::tile::GeomType;
use geozero::mvt::{Message, Tile};
use std::io::Read;

use crate::error::PipelineError;

/// Side length of the detection grid. This is the encoding's extent, not a tunable.
pub const DETECTION_EXTENT: f64 = 4096.0;

/// Polygon ring in source-image pixel space.
pub type PixelPolygon = Vec<[f64; 2]>;

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

// Function to detect if data is gzipped (checking for gzip magic number)
fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1F && data[1] == 0x8B
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed_data = Vec::new();
    decoder.read_to_end(&mut decompressed_data).map_err(|e| {
        PipelineError::MalformedDetectionGeometry(format!("gzip decompression failed: {}", e))
    })?;
    Ok(decompressed_data)
}

fn ungzip(raw: &[u8]) -> Result<Vec<u8>, PipelineError> {
    if is_gzipped(raw) {
        decompress_gzip(raw)
    } else {
        Ok(raw.to_vec())
    }
}

fn base64_bytes(text: &str) -> Result<Vec<u8>, PipelineError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| PipelineError::MalformedDetectionGeometry(format!("invalid base64: {}", e)))
}

// Decode zig-zag encoding
fn zigzag(value: u32) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Walk a geometry command stream and return the first ring in grid units.
///
/// ClosePath does not repeat the first vertex.
fn decode_outer_ring(commands: &[u32]) -> Result<Vec<[f64; 2]>, PipelineError> {
    let mut ring = Vec::new();
    let mut cursor_x: i64 = 0;
    let mut cursor_y: i64 = 0;
    let mut i = 0;

    while i < commands.len() {
        let cmd_id = commands[i] & 0x7;
        let cmd_count = (commands[i] >> 3) as usize;
        i += 1;

        match cmd_id {
            CMD_MOVE_TO | CMD_LINE_TO => {
                // A second MoveTo starts the next ring, which we don't keep
                if cmd_id == CMD_MOVE_TO && !ring.is_empty() {
                    break;
                }
                if i + 2 * cmd_count > commands.len() {
                    return Err(PipelineError::MalformedDetectionGeometry(
                        "truncated command parameters".into(),
                    ));
                }
                for _ in 0..cmd_count {
                    cursor_x += zigzag(commands[i]);
                    cursor_y += zigzag(commands[i + 1]);
                    ring.push([cursor_x as f64, cursor_y as f64]);
                    i += 2;
                }
            }
            CMD_CLOSE_PATH => break,
            other => {
                return Err(PipelineError::MalformedDetectionGeometry(format!(
                    "unknown geometry command {}",
                    other
                )));
            }
        }
    }

    if ring.len() < 3 {
        return Err(PipelineError::MalformedDetectionGeometry(format!(
            "ring has {} vertices",
            ring.len()
        )));
    }
    Ok(ring)
}

/// Outer ring of the first feature in a raw (or gzipped) tile, in 0..4096
/// grid units.
pub fn decode_grid_ring(raw: &[u8]) -> Result<Vec<[f64; 2]>, PipelineError> {
    let data = ungzip(raw)?;
    let tile = Tile::decode(data.as_slice())
        .map_err(|e| PipelineError::MalformedDetectionGeometry(format!("invalid vector tile: {}", e)))?;

    let feature = tile
        .layers
        .iter()
        .flat_map(|layer| layer.features.iter())
        .next()
        .ok_or_else(|| PipelineError::MalformedDetectionGeometry("tile has no features".into()))?;

    if let Some(geom_type) = feature.r#type {
        if geom_type != GeomType::Polygon as i32 {
            return Err(PipelineError::MalformedDetectionGeometry(format!(
                "expected polygon geometry, got type {}",
                geom_type
            )));
        }
    }

    decode_outer_ring(&feature.geometry)
}

/// Scale grid coordinates into a `width` x `height` image.
pub fn rescale(ring: &[[f64; 2]], width: u32, height: u32) -> PixelPolygon {
    ring.iter()
        .map(|[x, y]| {
            [
                x / DETECTION_EXTENT * width as f64,
                y / DETECTION_EXTENT * height as f64,
            ]
        })
        .collect()
}

/// Inverse of [`rescale`].
pub fn to_grid(polygon: &[[f64; 2]], width: u32, height: u32) -> Vec<[f64; 2]> {
    polygon
        .iter()
        .map(|[x, y]| {
            [
                x / width as f64 * DETECTION_EXTENT,
                y / height as f64 * DETECTION_EXTENT,
            ]
        })
        .collect()
}

/// [`decode_grid_ring`] for the base64 text of a detection's `geometry` field.
pub fn decode_text_ring(text: &str) -> Result<Vec<[f64; 2]>, PipelineError> {
    decode_grid_ring(&base64_bytes(text)?)
}

pub fn decode(raw: &[u8], width: u32, height: u32) -> Result<PixelPolygon, PipelineError> {
    let ring = decode_grid_ring(raw)?;
    Ok(rescale(&ring, width, height))
}

pub fn decode_text(text: &str, width: u32, height: u32) -> Result<PixelPolygon, PipelineError> {
    let ring = decode_text_ring(text)?;
    Ok(rescale(&ring, width, height))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use geozero::mvt::tile::{Feature, Layer};
    use std::io::Write;

    fn command(id: u32, count: u32) -> u32 {
        (id & 0x7) | (count << 3)
    }

    fn zz(value: i64) -> u32 {
        ((value << 1) ^ (value >> 63)) as u32
    }

    /// Geometry commands for closed rings given in absolute grid units.
    pub(crate) fn ring_commands(rings: &[&[[i64; 2]]]) -> Vec<u32> {
        let mut commands = Vec::new();
        let (mut cx, mut cy) = (0i64, 0i64);
        for ring in rings {
            let [x0, y0] = ring[0];
            commands.push(command(CMD_MOVE_TO, 1));
            commands.push(zz(x0 - cx));
            commands.push(zz(y0 - cy));
            (cx, cy) = (x0, y0);
            commands.push(command(CMD_LINE_TO, (ring.len() - 1) as u32));
            for &[x, y] in &ring[1..] {
                commands.push(zz(x - cx));
                commands.push(zz(y - cy));
                (cx, cy) = (x, y);
            }
            commands.push(command(CMD_CLOSE_PATH, 1));
        }
        commands
    }

    pub(crate) fn tile_bytes(commands: Vec<u32>, geom_type: GeomType) -> Vec<u8> {
        let tile = Tile {
            layers: vec![Layer {
                version: 2,
                name: "mpy-or".to_string(),
                features: vec![Feature {
                    id: Some(1),
                    tags: vec![],
                    r#type: Some(geom_type as i32),
                    geometry: commands,
                }],
                keys: vec![],
                values: vec![],
                extent: Some(4096),
            }],
        };
        tile.encode_to_vec()
    }

    /// Base64 blob as the detections endpoint returns it.
    pub(crate) fn detection_blob(rings: &[&[[i64; 2]]]) -> String {
        STANDARD.encode(tile_bytes(ring_commands(rings), GeomType::Polygon))
    }

    const SQUARE: [[i64; 2]; 4] = [[0, 0], [4096, 0], [4096, 4096], [0, 4096]];

    #[test]
    fn full_square_maps_to_image_corners() {
        let blob = detection_blob(&[&SQUARE]);
        let polygon = decode_text(&blob, 800, 600).unwrap();
        assert_eq!(
            polygon,
            vec![[0.0, 0.0], [800.0, 0.0], [800.0, 600.0], [0.0, 600.0]]
        );
    }

    #[test]
    fn holes_are_discarded() {
        let hole: [[i64; 2]; 4] = [[1000, 1000], [1000, 2000], [2000, 2000], [2000, 1000]];
        let blob = detection_blob(&[&SQUARE, &hole]);
        let ring = decode_text_ring(&blob).unwrap();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring[2], [4096.0, 4096.0]);
    }

    #[test]
    fn rescale_round_trips_through_grid() {
        let ring: [[i64; 2]; 5] = [[12, 40], [2048, 17], [4000, 1999], [3001, 4095], [7, 3333]];
        let blob = detection_blob(&[&ring]);
        let grid = decode_text_ring(&blob).unwrap();
        for (width, height) in [(800, 600), (2048, 1536), (333, 977)] {
            let pixels = decode_text(&blob, width, height).unwrap();
            let back = to_grid(&pixels, width, height);
            for (a, b) in back.iter().zip(grid.iter()) {
                assert_relative_eq!(a[0], b[0], epsilon = 1e-9);
                assert_relative_eq!(a[1], b[1], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn accepts_raw_and_gzipped_bytes() {
        let bytes = tile_bytes(ring_commands(&[&SQUARE]), GeomType::Polygon);
        assert_eq!(decode_grid_ring(&bytes).unwrap().len(), 4);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes).unwrap();
        let gzipped = encoder.finish().unwrap();
        assert_eq!(decode_grid_ring(&gzipped).unwrap().len(), 4);
    }

    #[test]
    fn base64_text_is_not_read_as_a_tile() {
        let blob = detection_blob(&[&SQUARE]);
        assert!(decode_grid_ring(blob.as_bytes()).is_err());
        assert_eq!(decode_text_ring(&blob).unwrap().len(), 4);

        let wrapped = format!("{}\n{}", &blob[..10], &blob[10..]);
        assert_eq!(decode_text_ring(&wrapped).unwrap().len(), 4);
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        let raw_cases: Vec<Vec<u8>> = vec![
            b"\x0a\x03abc".to_vec(),
            Tile { layers: vec![] }.encode_to_vec(),
            tile_bytes(ring_commands(&[&SQUARE]), GeomType::Linestring),
            tile_bytes(vec![command(CMD_MOVE_TO, 1), 2], GeomType::Polygon),
            vec![0x1F, 0x8B, 0x00],
        ];
        for raw in &raw_cases {
            assert!(matches!(
                decode(raw, 100, 100),
                Err(PipelineError::MalformedDetectionGeometry(_))
            ));
        }

        let mut text_cases = vec!["not base64 at all!".to_string(), String::new()];
        text_cases.extend(raw_cases.iter().map(|raw| STANDARD.encode(raw)));
        for text in text_cases {
            assert!(matches!(
                decode_text(&text, 100, 100),
                Err(PipelineError::MalformedDetectionGeometry(_))
            ));
        }
    }
}
