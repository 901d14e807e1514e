use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology;
use imageproc::region_labelling::{Connectivity, connected_components};
use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;

use super::segmentation::LeafSegmentation;
use super::{AnalysisError, color, superpixel, vision};
use crate::config::{DamageConfig, SuperpixelConfig};

/// Mean and standard deviation of gray levels over leaf pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LeafBrightness {
    pub mean: f32,
    pub std_dev: f32,
}

impl LeafBrightness {
    pub fn measure(gray: &GrayImage, leaf_mask: &GrayImage) -> Self {
        let mut count = 0u64;
        let mut sum = 0.0f64;
        let mut squares = 0.0f64;
        for (g, m) in gray.pixels().zip(leaf_mask.pixels()) {
            if m[0] > 0 {
                let v = g[0] as f64;
                count += 1;
                sum += v;
                squares += v * v;
            }
        }
        if count == 0 {
            return Self::default();
        }
        let mean = sum / count as f64;
        let variance = (squares / count as f64 - mean * mean).max(0.0);
        Self {
            mean: mean as f32,
            std_dev: variance.sqrt() as f32,
        }
    }
}

/// Hue window `[mean - spread, mean + spread]` clamped to `limits`, truncated
/// to the 8-bit hue scale. `None` when clamping leaves nothing.
pub fn brown_hue_band(mean_hue: f64, limits: [u8; 2], spread: f64) -> Option<(u8, u8)> {
    let lower = (mean_hue - spread).max(limits[0] as f64) as u8;
    let upper = (mean_hue + spread).min(limits[1] as f64) as u8;
    (lower <= upper).then_some((lower, upper))
}

/// Per-channel lesion candidates; each mask is 255 where its symptom shows.
pub struct LesionChannels {
    /// Brown hues around the frame's mean hue.
    pub brown: GrayImage,
    /// Darker than the local neighborhood.
    pub dark: GrayImage,
    /// Low saturation, high value.
    pub bleached: GrayImage,
    /// Saturated yellow.
    pub chlorotic: GrayImage,
    /// Low saturation, mid value.
    pub necrotic: GrayImage,
}

impl LesionChannels {
    /// Union of every channel, restricted to the leaf.
    pub fn union(&self, leaf_mask: &GrayImage) -> GrayImage {
        let mut mask = GrayImage::new(leaf_mask.width(), leaf_mask.height());
        for (x, y, leaf) in leaf_mask.enumerate_pixels() {
            if leaf[0] == 0 {
                continue;
            }
            let hit = [
                &self.brown,
                &self.dark,
                &self.bleached,
                &self.chlorotic,
                &self.necrotic,
            ]
            .iter()
            .any(|channel| channel.get_pixel(x, y)[0] > 0);
            if hit {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        mask
    }
}

/// Multi-channel lesion detector restricted to the leaf region.
#[derive(Debug, Clone, Default)]
pub struct DamageDetector {
    config: DamageConfig,
    superpixels: SuperpixelConfig,
}

impl DamageDetector {
    pub fn new(config: DamageConfig, superpixels: SuperpixelConfig) -> Self {
        Self {
            config,
            superpixels,
        }
    }

    /// Lesion mask (255 = lesion) with the dimensions of the segmented image.
    pub fn detect(&self, segmentation: &LeafSegmentation) -> Result<GrayImage, AnalysisError> {
        let leaf_mask = &segmentation.leaf_mask;
        let (width, height) = leaf_mask.dimensions();
        let leaf_pixels = segmentation.leaf_pixels();
        if leaf_pixels == 0 {
            return Ok(GrayImage::new(width, height));
        }

        let candidates = self
            .channels(&segmentation.leaf_only, leaf_mask)?
            .union(leaf_mask);
        let opened = morphology::open(&candidates, Norm::LInf, self.config.open_radius);
        let closed = morphology::close(&opened, Norm::LInf, self.config.close_radius);

        let min_pixels = self
            .config
            .min_component_pixels
            .max((self.config.min_component_fraction * leaf_pixels as f64).ceil() as usize);
        let denoised = drop_small_components(&closed, min_pixels);

        let superpixels = superpixel::slic(&segmentation.enhanced, &self.superpixels)?;
        let refined = superpixels.vote(&denoised, self.superpixels.coverage_threshold);
        Ok(intersect(&refined, leaf_mask))
    }

    /// Evaluates every symptom channel over the leaf-only image.
    pub fn channels(
        &self,
        leaf_only: &RgbImage,
        leaf_mask: &GrayImage,
    ) -> Result<LesionChannels, AnalysisError> {
        let c = &self.config;
        let hsv = color::to_hsv(leaf_only)?;
        let gray = color::to_gray(leaf_only)?;

        Ok(LesionChannels {
            brown: self.brown_channel(&hsv)?,
            dark: self.dark_channel(&gray, leaf_mask)?,
            bleached: color::in_range(
                &hsv,
                [0, 0, c.white_min_value],
                [180, c.white_max_saturation, 255],
            )?,
            chlorotic: color::in_range(
                &hsv,
                [c.yellow_hue[0], c.yellow_min_saturation, c.yellow_min_value],
                [c.yellow_hue[1], 255, 255],
            )?,
            necrotic: color::in_range(
                &hsv,
                [0, 0, c.gray_value[0]],
                [180, c.gray_max_saturation, c.gray_value[1]],
            )?,
        })
    }

    fn brown_channel(&self, hsv: &Mat) -> Result<GrayImage, AnalysisError> {
        let c = &self.config;
        let mean_hue = color::mean_hue(hsv)?;
        match brown_hue_band(mean_hue, c.brown_hue_limits, c.brown_hue_spread) {
            Some((lower, upper)) => color::in_range(
                hsv,
                [lower, c.brown_min_saturation, c.brown_value[0]],
                [upper, 255, c.brown_value[1]],
            ),
            None => {
                log::debug!("Mean hue {:.1} leaves no brown hue window", mean_hue);
                let size = hsv.size()?;
                Ok(GrayImage::new(size.width as u32, size.height as u32))
            }
        }
    }

    /// Pixels darker than their Gaussian-weighted neighborhood by more than an
    /// offset derived from the leaf's own brightness.
    fn dark_channel(&self, gray: &GrayImage, leaf_mask: &GrayImage) -> Result<GrayImage, AnalysisError> {
        let brightness = LeafBrightness::measure(gray, leaf_mask);
        let divisor = self.config.adaptive_offset_divisor.max(f32::EPSILON);
        let offset = brightness.mean / divisor + brightness.std_dev * self.config.adaptive_std_weight;
        let block = (self.config.adaptive_block_size | 1).max(3) as i32;

        let mut dark = Mat::default();
        imgproc::adaptive_threshold(
            &vision::gray_to_mat(gray)?,
            &mut dark,
            255.0,
            imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
            imgproc::THRESH_BINARY_INV,
            block,
            offset as f64,
        )?;
        vision::mat_to_gray(&dark)
    }
}

pub fn drop_small_components(mask: &GrayImage, min_pixels: usize) -> GrayImage {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut sizes: Vec<usize> = Vec::new();
    for label in labels.pixels() {
        let l = label[0] as usize;
        if l == 0 {
            continue;
        }
        if sizes.len() <= l {
            sizes.resize(l + 1, 0);
        }
        sizes[l] += 1;
    }

    let mut out = GrayImage::new(mask.width(), mask.height());
    for (dst, label) in out.pixels_mut().zip(labels.pixels()) {
        let l = label[0] as usize;
        if l > 0 && sizes[l] >= min_pixels {
            *dst = Luma([255]);
        }
    }
    out
}

fn intersect(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let mut out = GrayImage::new(a.width(), a.height());
    for ((dst, x), y) in out.pixels_mut().zip(a.pixels()).zip(b.pixels()) {
        if x[0] > 0 && y[0] > 0 {
            *dst = Luma([255]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::segmentation::{LeafSegmenter, count_set};
    use image::Rgb;

    const LEAF_GREEN: Rgb<u8> = Rgb([30, 150, 40]);

    fn green_leaf_with_spot(size: u32, spot: Option<(u32, u32)>) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| match spot {
            Some((lo, hi)) if (lo..hi).contains(&x) && (lo..hi).contains(&y) => {
                Rgb([139, 69, 19])
            }
            _ => LEAF_GREEN,
        })
    }

    /// A 32x32 green leaf with a 6x6 patch of `patch` centered at (16, 16).
    fn leaf_with_patch(patch: Rgb<u8>) -> (RgbImage, GrayImage) {
        let image = RgbImage::from_fn(32, 32, |x, y| {
            if (13..19).contains(&x) && (13..19).contains(&y) { patch } else { LEAF_GREEN }
        });
        (image, GrayImage::from_pixel(32, 32, Luma([255])))
    }

    fn channels_of(patch: Rgb<u8>) -> LesionChannels {
        let (image, mask) = leaf_with_patch(patch);
        DamageDetector::default().channels(&image, &mask).unwrap()
    }

    fn fires(channel: &GrayImage) -> (bool, bool) {
        (channel.get_pixel(16, 16)[0] == 255, channel.get_pixel(2, 2)[0] == 255)
    }

    #[test]
    fn test_uniform_leaf_has_no_lesions() {
        let segmentation = LeafSegmenter::default()
            .segment(&green_leaf_with_spot(64, None))
            .unwrap();
        let lesions = DamageDetector::default().detect(&segmentation).unwrap();
        assert_eq!(count_set(&lesions), 0);
    }

    #[test]
    fn test_brown_spot_is_detected() {
        let segmentation = LeafSegmenter::default()
            .segment(&green_leaf_with_spot(64, Some((24, 40))))
            .unwrap();
        let lesions = DamageDetector::default().detect(&segmentation).unwrap();
        let ratio = count_set(&lesions) as f64 / segmentation.leaf_pixels() as f64 * 100.0;
        assert!((4.0..=10.0).contains(&ratio), "ratio {ratio}");
        assert_eq!(lesions.get_pixel(32, 32)[0], 255);
        assert_eq!(lesions.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn test_bleached_channel() {
        let channels = channels_of(Rgb([235, 235, 225]));
        assert_eq!(fires(&channels.bleached), (true, false));
        assert_eq!(fires(&channels.chlorotic), (false, false));
    }

    #[test]
    fn test_chlorotic_channel() {
        let channels = channels_of(Rgb([200, 190, 40]));
        assert_eq!(fires(&channels.chlorotic), (true, false));
        assert_eq!(fires(&channels.bleached), (false, false));
    }

    #[test]
    fn test_necrotic_channel() {
        let channels = channels_of(Rgb([120, 120, 115]));
        assert_eq!(fires(&channels.necrotic), (true, false));
        assert_eq!(fires(&channels.bleached), (false, false));
        assert_eq!(fires(&channels.dark), (false, false));
    }

    #[test]
    fn test_dark_channel() {
        let channels = channels_of(Rgb([20, 60, 25]));
        assert_eq!(fires(&channels.dark), (true, false));
        assert_eq!(fires(&channels.necrotic), (false, false));
        assert_eq!(fires(&channels.chlorotic), (false, false));
    }

    #[test]
    fn test_brown_channel_follows_mean_hue() {
        // Mostly masked-out black frame: the mean hue is low and the window
        // covers brown.
        let image = RgbImage::from_fn(32, 32, |x, y| {
            if (13..19).contains(&x) && (13..19).contains(&y) {
                Rgb([139, 69, 19])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let mask = GrayImage::from_pixel(32, 32, Luma([255]));
        let channels = DamageDetector::default().channels(&image, &mask).unwrap();
        assert_eq!(fires(&channels.brown), (true, false));

        // A frame full of green pushes the window past the brown limits.
        let channels = channels_of(Rgb([139, 69, 19]));
        assert_eq!(count_set(&channels.brown), 0);
    }

    #[test]
    fn test_brown_hue_band_is_clamped() {
        assert_eq!(brown_hue_band(0.0, [5, 35], 20.0), Some((5, 20)));
        assert_eq!(brown_hue_band(20.5, [5, 35], 20.0), Some((5, 35)));
        assert_eq!(brown_hue_band(30.0, [5, 35], 20.0), Some((10, 35)));
        assert_eq!(brown_hue_band(60.0, [5, 35], 20.0), None);
    }

    #[test]
    fn test_union_is_clipped_to_leaf() {
        let (image, _) = leaf_with_patch(Rgb([235, 235, 225]));
        let mask = GrayImage::from_fn(32, 32, |x, _| Luma([if x < 16 { 255 } else { 0 }]));
        let union = DamageDetector::default()
            .channels(&image, &mask)
            .unwrap()
            .union(&mask);
        assert_eq!(union.get_pixel(14, 14)[0], 255);
        assert_eq!(union.get_pixel(17, 14)[0], 0);
    }

    #[test]
    fn test_lesions_never_leave_the_leaf() {
        let mut segmentation = LeafSegmenter::default()
            .segment(&green_leaf_with_spot(64, Some((24, 40))))
            .unwrap();
        for y in 0..64 {
            for x in 32..64 {
                segmentation.leaf_mask.put_pixel(x, y, Luma([0]));
            }
        }
        let lesions = DamageDetector::default().detect(&segmentation).unwrap();
        assert!(lesions.enumerate_pixels().all(|(x, _, p)| x < 32 || p[0] == 0));
    }

    #[test]
    fn test_empty_leaf_gives_empty_mask() {
        let mut segmentation = LeafSegmenter::default()
            .segment(&green_leaf_with_spot(32, None))
            .unwrap();
        segmentation.leaf_mask = GrayImage::new(32, 32);
        let lesions = DamageDetector::default().detect(&segmentation).unwrap();
        assert_eq!(count_set(&lesions), 0);
    }

    #[test]
    fn test_small_components_are_dropped() {
        let mask = GrayImage::from_fn(20, 20, |x, y| {
            let big = (2..8).contains(&x) && (2..8).contains(&y);
            let speck = x == 15 && y == 15;
            Luma([if big || speck { 255 } else { 0 }])
        });
        let cleaned = drop_small_components(&mask, 4);
        assert_eq!(count_set(&cleaned), 36);
        assert_eq!(cleaned.get_pixel(15, 15)[0], 0);
    }

    #[test]
    fn test_leaf_brightness_ignores_background() {
        let gray = GrayImage::from_fn(4, 1, |x, _| Luma([if x < 2 { 100 } else { 0 }]));
        let mask = GrayImage::from_fn(4, 1, |x, _| Luma([if x < 2 { 255 } else { 0 }]));
        let brightness = LeafBrightness::measure(&gray, &mask);
        assert_eq!(brightness.mean, 100.0);
        assert_eq!(brightness.std_dev, 0.0);
    }
}
