//! Color-space conversions on OpenCV's 8-bit scales, which the thresholds are
//! expressed in. HSV stores `H/2` (0..180), `S` and `V` (0..255).

use image::{GrayImage, RgbImage};
use opencv::core::{self, Mat, Scalar, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use super::AnalysisError;
use super::vision;

fn convert(image: &RgbImage, code: i32) -> Result<Mat, AnalysisError> {
    let src = vision::rgb_to_mat(image)?;
    let mut dst = Mat::default();
    imgproc::cvt_color_def(&src, &mut dst, code)?;
    Ok(dst)
}

pub fn to_hsv(image: &RgbImage) -> Result<Mat, AnalysisError> {
    convert(image, imgproc::COLOR_RGB2HSV)
}

pub fn to_lab(image: &RgbImage) -> Result<Mat, AnalysisError> {
    convert(image, imgproc::COLOR_RGB2Lab)
}

pub fn to_gray(image: &RgbImage) -> Result<GrayImage, AnalysisError> {
    vision::mat_to_gray(&convert(image, imgproc::COLOR_RGB2GRAY)?)
}

/// 255 where every channel of `hsv` lies within the inclusive bounds.
pub fn in_range(hsv: &Mat, lower: [u8; 3], upper: [u8; 3]) -> Result<GrayImage, AnalysisError> {
    let bound = |[a, b, c]: [u8; 3]| Scalar::new(a as f64, b as f64, c as f64, 0.0);
    let mut mask = Mat::default();
    core::in_range(hsv, &bound(lower), &bound(upper), &mut mask)?;
    vision::mat_to_gray(&mask)
}

/// Mean of the hue channel over every pixel of `hsv`.
pub fn mean_hue(hsv: &Mat) -> Result<f64, AnalysisError> {
    let mean = core::mean_def(hsv)?;
    Ok(mean[0])
}

/// Equalizes the lightness channel of `image` in Lab space with CLAHE over a
/// `tiles × tiles` grid.
pub fn enhance_contrast(
    image: &RgbImage,
    clip_limit: f64,
    tiles: i32,
) -> Result<RgbImage, AnalysisError> {
    let lab = to_lab(image)?;
    let mut channels = Vector::<Mat>::new();
    core::split(&lab, &mut channels)?;

    let mut clahe = imgproc::create_clahe(clip_limit, Size::new(tiles.max(1), tiles.max(1)))?;
    let mut lightness = Mat::default();
    clahe.apply(&channels.get(0)?, &mut lightness)?;
    channels.set(0, lightness)?;

    let mut merged = Mat::default();
    core::merge(&channels, &mut merged)?;
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(&merged, &mut rgb, imgproc::COLOR_Lab2RGB)?;
    vision::mat_to_rgb(&rgb)
}
