//! Crop tables and charts out of a page image.
//!
//! Detection and cropping both run on the blocking pool: the layout engine
//! may be a subprocess or a native model, and enhancement is pure CPU work.
//! Neither may stall the async workers driving other pages.

use crate::config::ExtractionConfig;
use crate::model::{BoundingBox, ContentKind, ElementType, Segment};
use crate::pipeline::enhance::{EnhanceOptions, SegmentEnhancer};
use crate::pipeline::layout::{LayoutEngineManager, LayoutRegion};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Cropping parameters, detached from the config so they can move into a
/// blocking task.
#[derive(Debug, Clone)]
pub struct CropOptions {
    pub padding: u32,
    pub max_segments: Option<usize>,
    pub row_bucket_px: u32,
    pub enhance: EnhanceOptions,
}

impl CropOptions {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            padding: config.segment_padding,
            max_segments: config.max_segments,
            row_bucket_px: config.row_bucket_px.max(1),
            enhance: config.enhance.clone(),
        }
    }
}

/// Detect, crop, enhance and order the elements of one page.
///
/// Returns an empty list on any layout failure; the caller treats that as
/// "use the whole page".
pub async fn segment(
    page: usize,
    image: Arc<DynamicImage>,
    kind: ContentKind,
    expected: usize,
    config: &ExtractionConfig,
    layout: &Arc<LayoutEngineManager>,
) -> Vec<Segment> {
    if layout.is_disabled() {
        debug!("Page {}: segmentation disabled for this run", page);
        return Vec::new();
    }

    let manager = Arc::clone(layout);
    let detect_image = Arc::clone(&image);
    let lang = config.layout_lang.clone();
    // Command detectors kill their own process at this same deadline.
    let limit = Duration::from_secs(config.layout_timeout_secs);

    let regions = match timeout(
        limit,
        tokio::task::spawn_blocking(move || manager.detect(&detect_image, &lang)),
    )
    .await
    {
        Ok(Ok(regions)) => regions,
        Ok(Err(join_err)) => {
            warn!("Page {}: layout task panicked: {}", page, join_err);
            return Vec::new();
        }
        Err(_) => {
            warn!("Page {}: layout detection timed out after {}s", page, limit.as_secs());
            return Vec::new();
        }
    };

    let options = CropOptions::from_config(config);
    let segments = match tokio::task::spawn_blocking(move || {
        crop_segments(&image, regions, kind, &options)
    })
    .await
    {
        Ok(segments) => segments,
        Err(join_err) => {
            warn!("Page {}: cropping task panicked: {}", page, join_err);
            return Vec::new();
        }
    };

    if segments.is_empty() {
        info!("Page {}: layout found no {} elements", page, kind);
    } else {
        info!(
            page,
            segments = segments.len(),
            "Page {}: {} segment(s) detected (expected {})",
            page,
            segments.len(),
            expected
        );
    }
    segments
}

/// Turn detector regions into ordered, enhanced crops.
pub fn crop_segments(
    image: &DynamicImage,
    regions: Vec<LayoutRegion>,
    kind: ContentKind,
    options: &CropOptions,
) -> Vec<Segment> {
    let (width, height) = (image.width(), image.height());

    let mut candidates: Vec<(ElementType, BoundingBox, Option<f32>)> = regions
        .into_iter()
        .filter_map(|region| {
            let element = ElementType::from_layout_label(&region.label)?;
            kind.accepts(element).then_some((element, region))
        })
        .map(|(element, region)| {
            let bbox = BoundingBox::from_detection(region.bbox, width, height);
            (element, bbox, region.score)
        })
        .filter(|(_, bbox, _)| !bbox.is_degenerate())
        .collect();

    sort_reading_order(&mut candidates, options.row_bucket_px);
    if let Some(max) = options.max_segments {
        if candidates.len() > max {
            debug!("Capping {} detected elements at {}", candidates.len(), max);
            candidates.truncate(max);
        }
    }

    candidates
        .into_iter()
        .filter_map(|(element_type, bbox, confidence)| {
            let padded = bbox.padded(options.padding, width, height);
            if padded.is_degenerate() {
                return None;
            }
            let crop = image.crop_imm(padded.x1, padded.y1, padded.width(), padded.height());
            Some((element_type, padded, confidence, crop))
        })
        .enumerate()
        .map(|(i, (element_type, bounding_box, confidence, crop))| Segment {
            element_type,
            image: SegmentEnhancer::apply(crop, &options.enhance),
            bounding_box,
            order_index: i + 1,
            confidence,
        })
        .collect()
}

/// Top-to-bottom in row buckets, then left-to-right.
fn sort_reading_order<T>(items: &mut [(T, BoundingBox, Option<f32>)], bucket: u32) {
    let bucket = bucket.max(1);
    items.sort_by_key(|(_, b, _)| (b.y1 / bucket, b.x1));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(label: &str, bbox: [f32; 4]) -> LayoutRegion {
        LayoutRegion {
            label: label.into(),
            bbox,
            score: Some(0.9),
        }
    }

    fn options() -> CropOptions {
        CropOptions {
            padding: 4,
            max_segments: None,
            row_bucket_px: 50,
            enhance: EnhanceOptions {
                enabled: false,
                ..Default::default()
            },
        }
    }

    #[test]
    fn reading_order_uses_row_buckets() {
        let image = DynamicImage::new_rgb8(400, 400);
        let regions = vec![
            region("table", [210.0, 212.0, 390.0, 300.0]),
            region("figure", [10.0, 230.0, 190.0, 300.0]),
            region("table", [10.0, 10.0, 390.0, 100.0]),
        ];
        let segs = crop_segments(&image, regions, ContentKind::Mixed, &options());
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].bounding_box.y1, 6);
        // y1 212 and 230 share bucket 4, so x decides.
        assert_eq!(segs[1].element_type, ElementType::Chart);
        assert_eq!(segs[2].element_type, ElementType::Table);
        let order: Vec<usize> = segs.iter().map(|s| s.order_index).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn filters_by_expected_kind_and_ignores_text() {
        let image = DynamicImage::new_rgb8(200, 200);
        let regions = vec![
            region("text", [0.0, 0.0, 100.0, 20.0]),
            region("figure", [0.0, 30.0, 100.0, 90.0]),
            region("table", [0.0, 100.0, 100.0, 190.0]),
        ];
        let segs = crop_segments(&image, regions, ContentKind::Table, &options());
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].element_type, ElementType::Table);
    }

    #[test]
    fn padding_is_clamped_and_crop_matches_box() {
        let image = DynamicImage::new_rgb8(100, 100);
        let segs = crop_segments(
            &image,
            vec![region("table", [2.0, 2.0, 98.0, 50.0])],
            ContentKind::Unknown,
            &options(),
        );
        let b = segs[0].bounding_box;
        assert_eq!(b, BoundingBox::from([0, 0, 100, 54]));
        assert_eq!((segs[0].image.width(), segs[0].image.height()), (100, 54));
    }

    #[test]
    fn degenerate_boxes_are_dropped() {
        let image = DynamicImage::new_rgb8(100, 100);
        let segs = crop_segments(
            &image,
            vec![
                region("table", [10.0, 10.0, 10.0, 80.0]),
                region("table", [150.0, 150.0, 180.0, 190.0]),
            ],
            ContentKind::Unknown,
            &options(),
        );
        assert!(segs.is_empty());
    }

    #[test]
    fn cap_keeps_reading_order_prefix() {
        let image = DynamicImage::new_rgb8(100, 400);
        let regions = (0..4)
            .rev()
            .map(|i| region("table", [0.0, i as f32 * 100.0, 100.0, i as f32 * 100.0 + 80.0]))
            .collect();
        let mut opts = options();
        opts.max_segments = Some(2);
        let segs = crop_segments(&image, regions, ContentKind::Table, &opts);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].bounding_box.y1, 0);
        assert_eq!(segs[1].bounding_box.y1, 96);
    }

    #[test]
    fn enhancement_upscales_small_crops() {
        let image = DynamicImage::new_rgb8(400, 400);
        let mut opts = options();
        opts.enhance = EnhanceOptions::default();
        let segs = crop_segments(
            &image,
            vec![region("table", [10.0, 10.0, 210.0, 110.0])],
            ContentKind::Table,
            &opts,
        );
        assert!(segs[0].image.width() >= 1600);
        assert_eq!(segs[0].bounding_box.width(), 208);
    }

    #[tokio::test]
    async fn disabled_layout_yields_no_segments() {
        let config = ExtractionConfig::default();
        let manager = Arc::new(LayoutEngineManager::from_config(&config));
        let image = Arc::new(DynamicImage::new_rgb8(50, 50));
        let segs = segment(1, image, ContentKind::Table, 1, &config, &manager).await;
        assert!(segs.is_empty());
        assert!(manager.is_disabled());
    }
}
