use std::io::Cursor;

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tandem_types::models::{FusionLayout, FusionProvenance, Role};

/// Longest edge of the derived thumbnail.
pub const THUMBNAIL_MAX_DIMENSION: u32 = 512;

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("source image unreadable: {0}")]
    Decode(#[from] image::ImageError),

    #[error("encoding failed: {0}")]
    Encode(image::ImageError),

    #[error("canvas {0}x{1} leaves no room for content")]
    CanvasTooSmall(u32, u32),

    #[error("moment has {0} captures, fusion needs 2")]
    WrongCaptureCount(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn ext(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// Canvas and encoding parameters. For fixed inputs and a fixed config the
/// computed canvas dimensions and placements never change.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Background gap between the two frames, in pixels.
    pub spacing: u32,
    pub background: [u8; 3],
    pub quality: u8,
    pub format: OutputFormat,
    pub layout: FusionLayout,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            canvas_width: 2048,
            canvas_height: 1536,
            spacing: 24,
            background: [255, 255, 255],
            quality: 90,
            format: OutputFormat::Jpeg,
            layout: FusionLayout::Horizontal,
        }
    }
}

/// One decoded capture plus the provenance that travels into the envelope.
pub struct SourceFrame {
    pub image: DynamicImage,
    pub user_id: Uuid,
    pub role: Role,
    pub source_path: String,
    pub captured_at: DateTime<Utc>,
    pub exif: Option<serde_json::Value>,
}

/// Output of a fusion run: encoded composite, encoded thumbnail, and the
/// provenance of both sources in input order.
pub struct FusedArtifact {
    pub bytes: Vec<u8>,
    pub thumbnail: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: FusionLayout,
    pub sources: Vec<FusionProvenance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LayoutPlan {
    canvas_width: u32,
    canvas_height: u32,
    first: Placement,
    second: Placement,
}

/// Integer rescale of `span` when the perpendicular dimension goes from
/// `from` to `to`. Round-half-up, never below one pixel.
fn scaled_span(span: u32, from: u32, to: u32) -> u32 {
    let scaled = (u64::from(span) * u64::from(to) + u64::from(from) / 2) / u64::from(from);
    u32::try_from(scaled.max(1)).unwrap_or(u32::MAX)
}

fn compute_layout(
    a: (u32, u32),
    b: (u32, u32),
    cfg: &FusionConfig,
) -> Result<LayoutPlan, FusionError> {
    match cfg.layout {
        FusionLayout::Horizontal => {
            // Fixed row height, summed widths.
            let mut row_h = cfg.canvas_height.saturating_sub(cfg.spacing);
            row_h -= row_h % 2;
            if row_h == 0 {
                return Err(FusionError::CanvasTooSmall(cfg.canvas_width, cfg.canvas_height));
            }
            let wa = scaled_span(a.0, a.1, row_h);
            let wb = scaled_span(b.0, b.1, row_h);
            Ok(LayoutPlan {
                canvas_width: wa + wb + cfg.spacing,
                canvas_height: row_h,
                first: Placement { x: 0, y: 0, width: wa, height: row_h },
                second: Placement { x: wa + cfg.spacing, y: 0, width: wb, height: row_h },
            })
        }
        FusionLayout::Vertical => {
            // Transpose: fixed column width, summed heights.
            let mut col_w = cfg.canvas_width.saturating_sub(cfg.spacing);
            col_w -= col_w % 2;
            if col_w == 0 {
                return Err(FusionError::CanvasTooSmall(cfg.canvas_width, cfg.canvas_height));
            }
            let ha = scaled_span(a.1, a.0, col_w);
            let hb = scaled_span(b.1, b.0, col_w);
            Ok(LayoutPlan {
                canvas_width: col_w,
                canvas_height: ha + hb + cfg.spacing,
                first: Placement { x: 0, y: 0, width: col_w, height: ha },
                second: Placement { x: 0, y: ha + cfg.spacing, width: col_w, height: hb },
            })
        }
    }
}

/// Deterministic two-frame compositor.
pub struct PhotoFusionEngine {
    config: FusionConfig,
}

impl PhotoFusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuse two decoded frames into one composite plus a thumbnail.
    ///
    /// Frame order is the caller's provenance order; the layout itself is
    /// symmetric. CPU-bound; run it on a blocking thread.
    pub fn fuse(
        &self,
        first: &SourceFrame,
        second: &SourceFrame,
    ) -> Result<FusedArtifact, FusionError> {
        let plan = compute_layout(
            first.image.dimensions(),
            second.image.dimensions(),
            &self.config,
        )?;

        let mut canvas = RgbImage::from_pixel(
            plan.canvas_width,
            plan.canvas_height,
            Rgb(self.config.background),
        );
        for (frame, slot) in [(first, &plan.first), (second, &plan.second)] {
            let resized = frame
                .image
                .resize_exact(slot.width, slot.height, FilterType::Lanczos3)
                .to_rgb8();
            imageops::overlay(&mut canvas, &resized, i64::from(slot.x), i64::from(slot.y));
        }

        let composite = DynamicImage::ImageRgb8(canvas);
        let bytes = self.encode(&composite)?;
        let thumb = composite.thumbnail(THUMBNAIL_MAX_DIMENSION, THUMBNAIL_MAX_DIMENSION);
        let thumbnail = self.encode(&thumb)?;

        Ok(FusedArtifact {
            bytes,
            thumbnail,
            width: plan.canvas_width,
            height: plan.canvas_height,
            layout: self.config.layout,
            sources: vec![provenance(first), provenance(second)],
        })
    }

    fn encode(&self, img: &DynamicImage) -> Result<Vec<u8>, FusionError> {
        let mut buf = Vec::new();
        let mut cursor = Cursor::new(&mut buf);
        let result = match self.config.format {
            OutputFormat::Jpeg => img.write_with_encoder(JpegEncoder::new_with_quality(
                &mut cursor,
                self.config.quality,
            )),
            OutputFormat::Png => img.write_with_encoder(PngEncoder::new(&mut cursor)),
        };
        result.map_err(FusionError::Encode)?;
        Ok(buf)
    }
}

fn provenance(frame: &SourceFrame) -> FusionProvenance {
    let (width, height) = frame.image.dimensions();
    FusionProvenance {
        user_id: frame.user_id,
        role: frame.role,
        source_path: frame.source_path.clone(),
        width,
        height,
        captured_at: frame.captured_at,
        exif: frame.exif.clone(),
    }
}

/// Decode an uploaded image in full.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, FusionError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Cheap header probe: dimensions plus a file extension for the blob name.
pub fn probe_image(bytes: &[u8]) -> Result<((u32, u32), &'static str), FusionError> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| FusionError::Decode(image::ImageError::IoError(e)))?;
    let ext = reader
        .format()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("bin");
    let dims = reader.into_dimensions()?;
    Ok((dims, ext))
}

/// Best-effort EXIF provenance. Absent or unparseable EXIF is not an error.
pub fn read_exif(bytes: &[u8]) -> Option<serde_json::Value> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    const TAGS: &[exif::Tag] = &[
        exif::Tag::Make,
        exif::Tag::Model,
        exif::Tag::DateTimeOriginal,
        exif::Tag::ExposureTime,
        exif::Tag::FNumber,
        exif::Tag::Orientation,
    ];
    let mut map = serde_json::Map::new();
    for &tag in TAGS {
        if let Some(field) = exif.get_field(tag, exif::In::PRIMARY) {
            map.insert(
                tag.to_string(),
                serde_json::Value::String(field.display_value().with_unit(&exif).to_string()),
            );
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, shade: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([shade, shade, shade])))
    }

    fn frame(img: DynamicImage, role: Role) -> SourceFrame {
        SourceFrame {
            image: img,
            user_id: Uuid::new_v4(),
            role,
            source_path: "captures/test.png".into(),
            captured_at: Utc::now(),
            exif: None,
        }
    }

    fn cfg() -> FusionConfig {
        FusionConfig {
            format: OutputFormat::Png,
            ..FusionConfig::default()
        }
    }

    #[test]
    fn horizontal_layout_sums_widths_at_even_row_height() {
        // 1536 - 24 = 1512, already even.
        let plan = compute_layout((400, 300), (300, 300), &cfg()).unwrap();
        assert_eq!(plan.canvas_height, 1512);
        assert_eq!(plan.first.width, 2016); // 400 * 1512 / 300
        assert_eq!(plan.second.width, 1512);
        assert_eq!(plan.canvas_width, 2016 + 1512 + 24);
        assert_eq!(plan.second.x, 2016 + 24);
    }

    #[test]
    fn row_height_is_normalized_to_even() {
        let config = FusionConfig {
            canvas_height: 101,
            spacing: 0,
            ..cfg()
        };
        let plan = compute_layout((50, 50), (50, 50), &config).unwrap();
        assert_eq!(plan.canvas_height, 100);
    }

    #[test]
    fn vertical_layout_is_the_transpose() {
        let config = FusionConfig {
            layout: FusionLayout::Vertical,
            ..cfg()
        };
        // 2048 - 24 = 2024, even.
        let plan = compute_layout((400, 300), (400, 400), &config).unwrap();
        assert_eq!(plan.canvas_width, 2024);
        assert_eq!(plan.first.height, 1518); // 300 * 2024 / 400
        assert_eq!(plan.second.height, 2024);
        assert_eq!(plan.canvas_height, 1518 + 2024 + 24);
        assert_eq!(plan.second.y, 1518 + 24);
    }

    #[test]
    fn degenerate_canvas_is_rejected() {
        let config = FusionConfig {
            canvas_height: 10,
            spacing: 10,
            ..cfg()
        };
        assert!(matches!(
            compute_layout((100, 100), (100, 100), &config),
            Err(FusionError::CanvasTooSmall(_, _))
        ));
    }

    #[test]
    fn fusion_is_deterministic_for_fixed_inputs() {
        let engine = PhotoFusionEngine::new(cfg());
        let a = frame(solid(400, 300, 40), Role::Initiator);
        let b = frame(solid(320, 240, 200), Role::Participant);

        let one = engine.fuse(&a, &b).unwrap();
        let two = engine.fuse(&a, &b).unwrap();
        assert_eq!((one.width, one.height), (two.width, two.height));
        assert_eq!(one.bytes, two.bytes);
        assert_eq!(one.layout, FusionLayout::Horizontal);
    }

    #[test]
    fn thumbnail_is_bounded_and_aspect_preserving() {
        let engine = PhotoFusionEngine::new(cfg());
        let a = frame(solid(400, 300, 10), Role::Initiator);
        let b = frame(solid(400, 300, 250), Role::Participant);

        let artifact = engine.fuse(&a, &b).unwrap();
        let thumb = decode_image(&artifact.thumbnail).unwrap();
        let (tw, th) = thumb.dimensions();
        assert!(tw <= THUMBNAIL_MAX_DIMENSION && th <= THUMBNAIL_MAX_DIMENSION);
        // Same orientation as the composite: wider than tall.
        assert!(tw > th);
    }

    #[test]
    fn provenance_keeps_roles_and_original_dimensions() {
        let engine = PhotoFusionEngine::new(cfg());
        let a = frame(solid(400, 300, 10), Role::Initiator);
        let b = frame(solid(320, 240, 250), Role::Participant);

        let artifact = engine.fuse(&a, &b).unwrap();
        assert_eq!(artifact.sources.len(), 2);
        assert_eq!(artifact.sources[0].role, Role::Initiator);
        assert_eq!((artifact.sources[0].width, artifact.sources[0].height), (400, 300));
        assert_eq!(artifact.sources[1].role, Role::Participant);
        assert_eq!((artifact.sources[1].width, artifact.sources[1].height), (320, 240));
    }

    #[test]
    fn unreadable_bytes_fail_with_decode_error() {
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(FusionError::Decode(_))
        ));
        assert!(probe_image(b"junk").is_err());
    }

    #[test]
    fn probe_reports_dimensions_and_extension() {
        let engine = PhotoFusionEngine::new(cfg());
        let img = solid(64, 48, 128);
        let bytes = engine.encode(&img).unwrap();

        let ((w, h), ext) = probe_image(&bytes).unwrap();
        assert_eq!((w, h), (64, 48));
        assert_eq!(ext, "png");
    }
}
