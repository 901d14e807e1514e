use image::{GrayImage, Luma, RgbImage};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use opencv::ximgproc;

use super::{AnalysisError, color};
use crate::config::SuperpixelConfig;

/// Regions smaller than this percentage of the nominal region size are merged
/// into a neighbor.
const MIN_ELEMENT_PERCENT: i32 = 25;

/// Label map of a SLIC over-segmentation, row-major.
pub struct Superpixels {
    pub labels: Vec<u32>,
    pub count: usize,
}

/// SLIC over the Lab image, sized so that about `config.segments` regions
/// cover the frame.
pub fn slic(image: &RgbImage, config: &SuperpixelConfig) -> Result<Superpixels, AnalysisError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Ok(Superpixels {
            labels: Vec::new(),
            count: 0,
        });
    }

    let lab = color::to_lab(image)?;
    let smoothed = if config.sigma > 0.0 {
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&lab, &mut blurred, Size::new(0, 0), config.sigma as f64)?;
        blurred
    } else {
        lab
    };

    let area = width as f32 * height as f32;
    let region_size = (area / config.segments.max(1) as f32).sqrt().round().max(1.0) as i32;
    let mut slic = ximgproc::create_superpixel_slic(
        &smoothed,
        ximgproc::SLIC,
        region_size,
        config.compactness,
    )?;
    slic.iterate(config.iterations.max(1) as i32)?;
    slic.enforce_label_connectivity(MIN_ELEMENT_PERCENT)?;

    let mut label_mat = Mat::default();
    slic.get_labels(&mut label_mat)?;
    let labels: Vec<u32> = label_mat
        .data_typed::<i32>()?
        .iter()
        .map(|&label| label.max(0) as u32)
        .collect();
    let count = labels.iter().max().map_or(0, |&max| max as usize + 1);
    Ok(Superpixels { labels, count })
}

impl Superpixels {
    /// Snaps `mask` to superpixel boundaries: a superpixel becomes wholly set
    /// when more than `threshold` of its pixels are set, wholly clear otherwise.
    pub fn vote(&self, mask: &GrayImage, threshold: f64) -> GrayImage {
        let mut set = vec![0usize; self.count];
        let mut total = vec![0usize; self.count];
        for (&label, pixel) in self.labels.iter().zip(mask.pixels()) {
            total[label as usize] += 1;
            if pixel[0] > 0 {
                set[label as usize] += 1;
            }
        }
        let selected: Vec<bool> = set
            .iter()
            .zip(&total)
            .map(|(&s, &t)| t > 0 && s as f64 / t as f64 > threshold)
            .collect();

        let mut out = GrayImage::new(mask.width(), mask.height());
        for (&label, dst) in self.labels.iter().zip(out.pixels_mut()) {
            *dst = Luma([if selected[label as usize] { 255 } else { 0 }]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn config(segments: usize) -> SuperpixelConfig {
        SuperpixelConfig {
            segments,
            ..SuperpixelConfig::default()
        }
    }

    #[test]
    fn test_labels_cover_the_frame() {
        let image = RgbImage::from_fn(60, 60, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 80]));
        let superpixels = slic(&image, &config(36)).unwrap();
        assert_eq!(superpixels.labels.len(), 3600);
        assert!(superpixels.count > 1);
        assert!(superpixels.labels.iter().all(|&l| (l as usize) < superpixels.count));
    }

    #[test]
    fn test_boundaries_follow_strong_color_edge() {
        let image = RgbImage::from_fn(40, 40, |x, _| {
            if x < 20 { Rgb([20, 120, 30]) } else { Rgb([140, 70, 20]) }
        });
        let superpixels = slic(&image, &config(16)).unwrap();
        for y in 0..40usize {
            let left = superpixels.labels[y * 40 + 12];
            let right = superpixels.labels[y * 40 + 27];
            assert_ne!(left, right);
        }
    }

    #[test]
    fn test_vote_fills_majority_regions_and_clears_sparse_ones() {
        let superpixels = Superpixels {
            labels: vec![0, 0, 1, 1, 0, 0, 1, 1],
            count: 2,
        };
        let mask = GrayImage::from_raw(4, 2, vec![255, 255, 0, 0, 255, 0, 255, 0])
            .unwrap_or_default();
        let voted = superpixels.vote(&mask, 0.4);
        assert_eq!(voted.into_raw(), vec![255, 255, 0, 0, 255, 255, 0, 0]);
    }

    #[test]
    fn test_vote_removes_speckle_and_keeps_solid_lesion() {
        // Four 4x4 superpixels in an 8x8 frame.
        let labels = (0..64u32).map(|i| (i / 8 / 4) * 2 + (i % 8) / 4).collect();
        let superpixels = Superpixels { labels, count: 4 };
        let mask = GrayImage::from_fn(8, 8, |x, y| {
            let solid = x < 4 && y < 4 && !(x == 0 && y == 0);
            let speck = x == 6 && y == 6;
            Luma([if solid || speck { 255 } else { 0 }])
        });
        let voted = superpixels.vote(&mask, 0.4);
        assert!(voted.enumerate_pixels().all(|(x, y, p)| (p[0] == 255) == (x < 4 && y < 4)));
    }
}
