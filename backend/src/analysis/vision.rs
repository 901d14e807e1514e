//! Conversions between `image` buffers and OpenCV matrices.

use image::{GrayImage, RgbImage};
use opencv::core::{self, Mat};
use opencv::prelude::*;

use super::AnalysisError;

pub fn rgb_to_mat(image: &RgbImage) -> Result<Mat, AnalysisError> {
    let flat = Mat::from_slice(image.as_raw())?;
    Ok(flat.reshape(3, image.height() as i32)?.try_clone()?)
}

pub fn gray_to_mat(image: &GrayImage) -> Result<Mat, AnalysisError> {
    let flat = Mat::from_slice(image.as_raw())?;
    Ok(flat.reshape(1, image.height() as i32)?.try_clone()?)
}

pub fn mat_to_rgb(mat: &Mat) -> Result<RgbImage, AnalysisError> {
    let (width, height) = dimensions(mat);
    if mat.typ() != core::CV_8UC3 {
        return Err(size_mismatch(width, height, 3));
    }
    RgbImage::from_raw(width, height, mat.data_bytes()?.to_vec())
        .ok_or_else(|| size_mismatch(width, height, 3))
}

pub fn mat_to_gray(mat: &Mat) -> Result<GrayImage, AnalysisError> {
    let (width, height) = dimensions(mat);
    if mat.typ() != core::CV_8UC1 {
        return Err(size_mismatch(width, height, 1));
    }
    GrayImage::from_raw(width, height, mat.data_bytes()?.to_vec())
        .ok_or_else(|| size_mismatch(width, height, 1))
}

fn dimensions(mat: &Mat) -> (u32, u32) {
    (mat.cols().max(0) as u32, mat.rows().max(0) as u32)
}

fn size_mismatch(width: u32, height: u32, channels: u32) -> AnalysisError {
    AnalysisError::Vision(opencv::Error::new(
        core::StsUnmatchedSizes,
        format!("{}x{} matrix is not {}-channel 8-bit", width, height, channels),
    ))
}
