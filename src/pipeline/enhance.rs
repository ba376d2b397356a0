//! Crop enhancement before extraction.
//!
//! Layout crops are often small, low-contrast and slightly soft. A bounded
//! pass makes them easier to read:
//!
//! 1. median denoise
//! 2. tile-based contrast-limited histogram equalisation on luminance
//! 3. mild unsharp mask
//! 4. rescale so the long side sits between `target_long_side` and
//!    `max_long_side`, with a floor on the short side
//!
//! Every step is bounded so the result never exceeds `max_long_side`.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::filter::median_filter;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Enhancement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceOptions {
    pub enabled: bool,
    /// Upscale until the long side reaches this. Default: 1600.
    pub target_long_side: u32,
    /// Downscale above this. Default: 3000.
    pub max_long_side: u32,
    /// Floor for the short side, bounded by `max_long_side`. Default: 800.
    pub min_short_side: u32,
    /// Median filter radius; 0 disables denoising. Default: 1.
    pub denoise_radius: u32,
    /// Histogram clip limit relative to a flat histogram. Default: 2.5.
    pub clip_limit: f32,
    /// Tiles per axis for local equalisation. Default: 8.
    pub tile_grid: u32,
    /// Unsharp-mask sigma; 0 disables sharpening. Default: 1.0.
    pub sharpen_sigma: f32,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            target_long_side: 1600,
            max_long_side: 3000,
            min_short_side: 800,
            denoise_radius: 1,
            clip_limit: 2.5,
            tile_grid: 8,
            sharpen_sigma: 1.0,
        }
    }
}

/// Chainable crop enhancer.
pub struct SegmentEnhancer {
    image: DynamicImage,
}

impl SegmentEnhancer {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn into_dynamic(self) -> DynamicImage {
        self.image
    }

    /// Run the full pass described by `options`.
    pub fn apply(image: DynamicImage, options: &EnhanceOptions) -> DynamicImage {
        if !options.enabled {
            return image;
        }
        Self::new(image)
            .denoise(options.denoise_radius)
            .equalize(options.clip_limit, options.tile_grid)
            .sharpen(options.sharpen_sigma)
            .rescale(options)
            .into_dynamic()
    }

    #[instrument(skip(self))]
    pub fn denoise(self, radius: u32) -> Self {
        if radius == 0 {
            return self;
        }
        let rgb = self.image.to_rgb8();
        Self {
            image: DynamicImage::ImageRgb8(median_filter(&rgb, radius, radius)),
        }
    }

    /// Local contrast normalisation on luminance; hue is kept by shifting
    /// every channel by the luminance change.
    #[instrument(skip(self))]
    pub fn equalize(self, clip_limit: f32, grid: u32) -> Self {
        if clip_limit <= 0.0 || grid == 0 {
            return self;
        }
        let rgb = self.image.to_rgb8();
        let luma = self.image.to_luma8();
        let equalized = clahe(&luma, clip_limit, grid);

        let mut out = RgbImage::new(rgb.width(), rgb.height());
        for (x, y, Rgb(px)) in rgb.enumerate_pixels() {
            let delta = equalized.get_pixel(x, y).0[0] as i16 - luma.get_pixel(x, y).0[0] as i16;
            let shift = |c: u8| (c as i16 + delta).clamp(0, 255) as u8;
            out.put_pixel(x, y, Rgb([shift(px[0]), shift(px[1]), shift(px[2])]));
        }
        Self {
            image: DynamicImage::ImageRgb8(out),
        }
    }

    #[instrument(skip(self))]
    pub fn sharpen(self, sigma: f32) -> Self {
        if sigma <= 0.0 {
            return self;
        }
        Self {
            image: self.image.unsharpen(sigma, 2),
        }
    }

    pub fn rescale(self, options: &EnhanceOptions) -> Self {
        let (w, h) = (self.image.width(), self.image.height());
        let (nw, nh) = target_dimensions(w, h, options);
        if (nw, nh) == (w, h) {
            return self;
        }
        debug!("Rescaling segment {}x{} → {}x{}", w, h, nw, nh);
        let filter = if nw > w {
            FilterType::CatmullRom
        } else {
            FilterType::Triangle
        };
        Self {
            image: self.image.resize_exact(nw, nh, filter),
        }
    }
}

/// Output size for a `w`×`h` crop.
pub fn target_dimensions(w: u32, h: u32, options: &EnhanceOptions) -> (u32, u32) {
    if w == 0 || h == 0 {
        return (w, h);
    }
    let long = w.max(h) as f64;
    let short = w.min(h) as f64;
    let max_long = options.max_long_side.max(1) as f64;

    let mut scale = if long < options.target_long_side as f64 {
        options.target_long_side as f64 / long
    } else if long > max_long {
        max_long / long
    } else {
        1.0
    };

    if short * scale < options.min_short_side as f64 {
        scale = (options.min_short_side as f64 / short).min(max_long / long).max(scale);
    }

    if (scale - 1.0).abs() < f64::EPSILON {
        return (w, h);
    }
    let scaled = |v: u32| ((v as f64 * scale).round() as u32).max(1);
    (scaled(w), scaled(h))
}

/// Contrast-limited adaptive histogram equalisation with bilinear blending
/// between tile lookup tables.
fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let tiles_x = grid.min(w).max(1);
    let tiles_y = grid.min(h).max(1);
    let tile_w = w.div_ceil(tiles_x);
    let tile_h = h.div_ceil(tiles_y);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let mut hist = [0u32; 256];
            let (x0, y0) = (tx * tile_w, ty * tile_h);
            let (x1, y1) = ((x0 + tile_w).min(w), (y0 + tile_h).min(h));
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1;
                }
            }
            luts[(ty * tiles_x + tx) as usize] = tile_lut(&mut hist, clip_limit);
        }
    }

    let lookup = |tx: u32, ty: u32, v: u8| luts[(ty * tiles_x + tx) as usize][v as usize] as f32;
    let locate = |pos: u32, size: u32, tiles: u32| -> (u32, u32, f32) {
        let g = (pos as f32 + 0.5) / size as f32 - 0.5;
        let lo = g.floor().clamp(0.0, (tiles - 1) as f32) as u32;
        let hi = (lo + 1).min(tiles - 1);
        let frac = (g - lo as f32).clamp(0.0, 1.0);
        (lo, hi, frac)
    };

    let mut out = GrayImage::new(w, h);
    for (x, y, Luma([v])) in gray.enumerate_pixels() {
        let (tx0, tx1, fx) = locate(x, tile_w, tiles_x);
        let (ty0, ty1, fy) = locate(y, tile_h, tiles_y);
        let top = lookup(tx0, ty0, *v) * (1.0 - fx) + lookup(tx1, ty0, *v) * fx;
        let bottom = lookup(tx0, ty1, *v) * (1.0 - fx) + lookup(tx1, ty1, *v) * fx;
        let value = top * (1.0 - fy) + bottom * fy;
        out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
    }
    out
}

fn tile_lut(hist: &mut [u32; 256], clip_limit: f32) -> [u8; 256] {
    let total: u32 = hist.iter().sum();
    let mut lut = [0u8; 256];
    if total == 0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as u8;
        }
        return lut;
    }

    let clip = ((clip_limit * total as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let bonus = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += bonus + u32::from(i < remainder);
    }

    let mut cdf = 0u32;
    for (i, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[i] = ((cdf as u64 * 255) / total as u64).min(255) as u8;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_crop_is_upscaled_to_target() {
        let o = EnhanceOptions::default();
        assert_eq!(target_dimensions(800, 1000, &o), (1280, 1600));
    }

    #[test]
    fn huge_crop_is_downscaled() {
        let o = EnhanceOptions::default();
        assert_eq!(target_dimensions(6000, 4000, &o), (3000, 2000));
    }

    #[test]
    fn short_side_floor_is_bounded_by_max_long() {
        let o = EnhanceOptions::default();
        let (w, h) = target_dimensions(1600, 200, &o);
        assert_eq!(w, 3000);
        assert_eq!(h, 375);
    }

    #[test]
    fn in_band_crop_is_untouched() {
        let o = EnhanceOptions::default();
        assert_eq!(target_dimensions(2000, 1200, &o), (2000, 1200));
    }

    #[test]
    fn clipped_tile_lut_spans_full_range() {
        let mut hist = [0u32; 256];
        hist[128] = 1000;
        let lut = tile_lut(&mut hist, 2.5);
        assert!(lut[255] == 255);
        assert!(lut[0] < lut[255]);
    }

    #[test]
    fn clahe_keeps_dimensions_and_stretches_contrast() {
        let mut img = GrayImage::new(256, 256);
        for (x, _, p) in img.enumerate_pixels_mut() {
            *p = Luma([100 + (x % 20) as u8]);
        }
        let out = clahe(&img, 2.5, 8);
        assert_eq!(out.dimensions(), (256, 256));
        let (min_in, max_in) = (100u8, 119u8);
        let max_out = out.pixels().map(|p| p.0[0]).max().unwrap();
        let min_out = out.pixels().map(|p| p.0[0]).min().unwrap();
        assert!(max_out - min_out > max_in - min_in);
    }

    #[test]
    fn full_pass_respects_bounds() {
        let img = DynamicImage::new_rgb8(300, 120);
        let out = SegmentEnhancer::apply(img, &EnhanceOptions::default());
        assert!(out.width().max(out.height()) <= 3000);
        assert!(out.width() >= 1600);
    }

    #[test]
    fn disabled_pass_is_identity() {
        let options = EnhanceOptions {
            enabled: false,
            ..Default::default()
        };
        let out = SegmentEnhancer::apply(DynamicImage::new_rgb8(10, 20), &options);
        assert_eq!((out.width(), out.height()), (10, 20));
    }
}
