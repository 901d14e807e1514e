use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use opencv::core::{self, Mat, Point, Rect, Scalar};
use opencv::imgproc;

use super::{AnalysisError, color, vision};
use crate::config::{EnhancementConfig, SegmentationConfig};

/// Components per GrabCut color model; fewer samples than this on either side
/// cannot seed the models.
const GMM_COMPONENTS: u64 = 5;
const FLOODED: u8 = 128;

/// Leaf isolation result. All images share the source dimensions.
pub struct LeafSegmentation {
    /// Contrast-enhanced copy of the whole source image.
    pub enhanced: RgbImage,
    /// 255 on leaf pixels, 0 elsewhere.
    pub leaf_mask: GrayImage,
    /// `enhanced` with every non-leaf pixel set to black.
    pub leaf_only: RgbImage,
    pub whole_frame: bool,
}

impl LeafSegmentation {
    pub fn leaf_pixels(&self) -> u64 {
        count_set(&self.leaf_mask)
    }
}

pub fn count_set(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| p[0] > 0).count() as u64
}

#[derive(Debug, Clone, Default)]
pub struct LeafSegmenter {
    enhancement: EnhancementConfig,
    config: SegmentationConfig,
}

impl LeafSegmenter {
    pub fn new(enhancement: EnhancementConfig, config: SegmentationConfig) -> Self {
        Self {
            enhancement,
            config,
        }
    }

    /// Isolates the leaf. Without a usable leaf region the whole frame is
    /// treated as leaf; only image-processing failures are errors.
    pub fn segment(&self, image: &RgbImage) -> Result<LeafSegmentation, AnalysisError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(LeafSegmentation {
                enhanced: image.clone(),
                leaf_mask: GrayImage::new(width, height),
                leaf_only: image.clone(),
                whole_frame: true,
            });
        }

        let enhanced = color::enhance_contrast(
            image,
            self.enhancement.clahe_clip_limit as f64,
            self.enhancement.clahe_tiles as i32,
        )?;

        let hsv = color::to_hsv(&enhanced)?;
        let mut coarse = color::in_range(&hsv, self.config.green_lower, self.config.green_upper)?;
        if self.config.fill_holes {
            coarse = fill_holes(&coarse)?;
        }
        let coarse_pixels = count_set(&coarse) as usize;
        let seed = if coarse_pixels < self.config.min_leaf_pixels {
            log::warn!(
                "Green region covers {} pixels (< {}), using the whole frame",
                coarse_pixels,
                self.config.min_leaf_pixels
            );
            GrayImage::from_pixel(width, height, Luma([255]))
        } else {
            coarse
        };

        let (leaf_mask, whole_frame) = settle(self.refine(&enhanced, &seed)?);
        let leaf_only = apply_mask(&enhanced, &leaf_mask);
        Ok(LeafSegmentation {
            enhanced,
            leaf_mask,
            leaf_only,
            whole_frame,
        })
    }

    /// GrabCut refinement, run on a downscaled copy for large frames.
    fn refine(&self, enhanced: &RgbImage, seed: &GrayImage) -> Result<GrayImage, AnalysisError> {
        let (width, height) = enhanced.dimensions();
        let longest = width.max(height);
        let max_side = self.config.refine_max_side.max(1);
        let iterations = self.config.grabcut_iterations as i32;
        if longest <= max_side {
            return grab_cut(enhanced, seed, iterations);
        }

        let scale = max_side as f64 / longest as f64;
        let small_w = ((width as f64 * scale).round() as u32).max(1);
        let small_h = ((height as f64 * scale).round() as u32).max(1);
        let small_image = imageops::resize(enhanced, small_w, small_h, FilterType::Triangle);
        let small_seed = imageops::resize(seed, small_w, small_h, FilterType::Nearest);
        let small_mask = grab_cut(&small_image, &small_seed, iterations)?;
        Ok(imageops::resize(&small_mask, width, height, FilterType::Nearest))
    }
}

/// Foreground mask from a seed mask: non-zero seed pixels are probable
/// foreground, the rest definite background. A seed that cannot train both
/// color models, or a failed cut, is returned as is.
pub fn grab_cut(
    image: &RgbImage,
    seed: &GrayImage,
    iterations: i32,
) -> Result<GrayImage, AnalysisError> {
    let set = count_set(seed);
    let clear = seed.width() as u64 * seed.height() as u64 - set;
    if set < GMM_COMPONENTS || clear < GMM_COMPONENTS {
        return Ok(seed.clone());
    }

    let trimap = GrayImage::from_fn(seed.width(), seed.height(), |x, y| {
        let label = if seed.get_pixel(x, y)[0] > 0 {
            imgproc::GC_PR_FGD
        } else {
            imgproc::GC_BGD
        };
        Luma([label as u8])
    });
    let source = vision::rgb_to_mat(image)?;
    let mut mask = vision::gray_to_mat(&trimap)?;
    let mut background_model = Mat::default();
    let mut foreground_model = Mat::default();
    if let Err(e) = imgproc::grab_cut(
        &source,
        &mut mask,
        Rect::default(),
        &mut background_model,
        &mut foreground_model,
        iterations.max(1),
        imgproc::GC_INIT_WITH_MASK,
    ) {
        log::warn!("GrabCut failed, keeping the color mask: {}", e);
        return Ok(seed.clone());
    }

    let mut refined = vision::mat_to_gray(&mask)?;
    for pixel in refined.pixels_mut() {
        let label = pixel[0] as i32;
        let foreground = label == imgproc::GC_FGD || label == imgproc::GC_PR_FGD;
        *pixel = Luma([if foreground { 255 } else { 0 }]);
    }
    Ok(refined)
}

/// An empty refinement, or one that claims every pixel, carries no leaf
/// boundary. Both become the whole frame, flagged by the returned bool.
pub fn settle(mask: GrayImage) -> (GrayImage, bool) {
    let set = count_set(&mask);
    let total = mask.width() as u64 * mask.height() as u64;
    if set == 0 || set == total {
        (GrayImage::from_pixel(mask.width(), mask.height(), Luma([255])), true)
    } else {
        (mask, false)
    }
}

/// Sets every clear pixel that is not 4-connected to the image border.
pub fn fill_holes(mask: &GrayImage) -> Result<GrayImage, AnalysisError> {
    let mut padded = Mat::default();
    core::copy_make_border(
        &vision::gray_to_mat(mask)?,
        &mut padded,
        1,
        1,
        1,
        1,
        core::BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;
    imgproc::flood_fill_def(&mut padded, Point::new(0, 0), Scalar::all(FLOODED as f64))?;
    let flooded = vision::mat_to_gray(&padded)?;

    Ok(GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let outside = flooded.get_pixel(x + 1, y + 1)[0] == FLOODED;
        Luma([if outside { 0 } else { 255 }])
    }))
}

pub fn apply_mask(image: &RgbImage, mask: &GrayImage) -> RgbImage {
    let mut out = RgbImage::new(image.width(), image.height());
    for ((src, m), dst) in image.pixels().zip(mask.pixels()).zip(out.pixels_mut()) {
        *dst = if m[0] > 0 { *src } else { Rgb([0, 0, 0]) };
    }
    out
}
