use ab_glyph::{FontArc, PxScale};
use image::{ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::PipelineConfig;
use crate::detections::PixelPolygon;
use crate::error::PipelineError;
use crate::models::Feature;

const OUTLINE: Rgba<u8> = Rgba([0, 255, 0, 255]);
const TAB_FILL: Rgba<u8> = Rgba([0, 0, 0, 200]);
const LABEL_TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);
const OUTLINE_WIDTH: i32 = 2;
const LABEL_SCALE: f32 = 14.0;
const TAB_PADDING: u32 = 4;
// Tab size when there is no font to measure text with
const BARE_TAB: (u32, u32) = (12, 12);

/// Draws decoded detections over their source image.
#[derive(Clone, Default)]
pub struct Renderer {
    font: Option<FontArc>,
}

impl Renderer {
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    /// Loads `font_path` when configured; labels are drawn as text only then.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let font = match &config.font_path {
            Some(path) => {
                let bytes = std::fs::read(path)?;
                let font = FontArc::try_from_vec(bytes)
                    .map_err(|e| PipelineError::Config(format!("cannot load font {}: {}", path.display(), e)))?;
                Some(font)
            }
            None => None,
        };
        Ok(Self { font })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Decode `image_bytes`, outline every polygon, put a label tab at each
    /// polygon's minimum corner and encode the result as PNG.
    pub fn render_detections(
        &self,
        image_bytes: &[u8],
        detections: &[(String, PixelPolygon)],
    ) -> Result<Vec<u8>, PipelineError> {
        let mut canvas: RgbaImage = image::load_from_memory(image_bytes)
            .map_err(|e| PipelineError::MissingImageData(format!("undecodable image: {}", e)))?
            .to_rgba8();

        for (label, polygon) in detections {
            if polygon.len() < 2 {
                continue;
            }
            draw_outline(&mut canvas, polygon);
            self.draw_label(&mut canvas, label, polygon);
        }

        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(canvas).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }

    /// Render a feature with whatever detections resolved to pixel space.
    pub fn render_feature(&self, feature: &Feature, image_bytes: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let detections: Vec<(String, PixelPolygon)> = feature
            .detections
            .iter()
            .filter_map(|d| d.pixel_polygon.clone().map(|polygon| (d.label.clone(), polygon)))
            .collect();
        self.render_detections(image_bytes, &detections)
    }

    /// Render every feature that has image bytes, in parallel. Output order
    /// follows `features`.
    pub fn render_all(
        &self,
        features: &[Feature],
        images: &HashMap<String, Vec<u8>>,
    ) -> Vec<(String, Result<Vec<u8>, PipelineError>)> {
        features
            .par_iter()
            .filter_map(|feature| {
                let bytes = images.get(&feature.id)?;
                Some((feature.id.clone(), self.render_feature(feature, bytes)))
            })
            .collect()
    }

    /// Archive file names for a run: `{feature_id}_{image_id}.png` for a
    /// rendered image, `.jpg` with the raw bytes when rendering failed.
    pub fn archive_entries(
        &self,
        features: &[Feature],
        images: &HashMap<String, Vec<u8>>,
    ) -> BTreeMap<String, Vec<u8>> {
        let rendered = self.render_all(features, images);
        let image_ids: HashMap<&str, &str> = features
            .iter()
            .filter_map(|f| f.image.as_ref().map(|image| (f.id.as_str(), image.id.as_str())))
            .collect();

        let mut entries = BTreeMap::new();
        for (feature_id, result) in rendered {
            let Some(image_id) = image_ids.get(feature_id.as_str()) else {
                continue;
            };
            let stem = format!("{}_{}", feature_id, image_id);
            match result {
                Ok(png) => {
                    entries.insert(format!("{}.png", stem), png);
                }
                Err(err) => {
                    warn!(feature = %feature_id, error = %err, "rendering failed, archiving raw image");
                    if let Some(raw) = images.get(&feature_id) {
                        entries.insert(format!("{}.jpg", stem), raw.clone());
                    }
                }
            }
        }
        entries
    }

    fn draw_label(&self, canvas: &mut RgbaImage, label: &str, polygon: &PixelPolygon) {
        let (min_x, min_y) = polygon
            .iter()
            .fold((f64::MAX, f64::MAX), |(x, y), p| (x.min(p[0]), y.min(p[1])));

        let scale = PxScale::from(LABEL_SCALE);
        let (tab_w, tab_h) = match &self.font {
            Some(font) => {
                let (w, h) = text_size(scale, font, label);
                (w + 2 * TAB_PADDING, h + 2 * TAB_PADDING)
            }
            None => BARE_TAB,
        };

        // Keep the tab inside the canvas
        let max_x = canvas.width().saturating_sub(tab_w) as f64;
        let max_y = canvas.height().saturating_sub(tab_h) as f64;
        let x = min_x.clamp(0.0, max_x) as i32;
        let y = min_y.clamp(0.0, max_y) as i32;

        draw_filled_rect_mut(canvas, Rect::at(x, y).of_size(tab_w.max(1), tab_h.max(1)), TAB_FILL);
        if let Some(font) = &self.font {
            let pad = TAB_PADDING as i32;
            draw_text_mut(canvas, LABEL_TEXT, x + pad, y + pad, scale, font, label);
        }
    }
}

fn draw_outline(canvas: &mut RgbaImage, polygon: &PixelPolygon) {
    let n = polygon.len();
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[(i + 1) % n];
        for k in 0..OUTLINE_WIDTH {
            let offset = k as f32;
            draw_line_segment_mut(
                canvas,
                (a[0] as f32 + offset, a[1] as f32),
                (b[0] as f32 + offset, b[1] as f32),
                OUTLINE,
            );
            draw_line_segment_mut(
                canvas,
                (a[0] as f32, a[1] as f32 + offset),
                (b[0] as f32, b[1] as f32 + offset),
                OUTLINE,
            );
        }
    }
}

/// Pack filename to bytes into a deflate-compressed zip archive.
pub fn export_archive(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, PipelineError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(bytes)?;
    }

    let cursor = writer.finish()?;
    debug!(entries = entries.len(), "archive written");
    Ok(cursor.into_inner())
}
