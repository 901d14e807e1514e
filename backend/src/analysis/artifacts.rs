use std::io::Cursor;
use std::sync::Arc;

use chrono::Utc;
use image::{GrayImage, ImageFormat, Rgb, RgbImage};
use uuid::Uuid;

use super::{DerivedImage, DerivedImageType};
use crate::storage::ObjectStore;

pub const ARTIFACT_PREFIX: &str = "analysis";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const ORIGINAL_WEIGHT: f32 = 0.7;
const OVERLAY_WEIGHT: f32 = 0.4;

/// JET colormap of `value` in `[0, 1]`, dark blue through red.
pub fn jet(value: f32) -> Rgb<u8> {
    let x = value.clamp(0.0, 1.0);
    let channel = |center: f32| ((1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// JET-colored lesion mask blended onto the original photograph.
pub fn render_overlay(original: &RgbImage, lesion_mask: &GrayImage) -> RgbImage {
    let mut out = RgbImage::new(original.width(), original.height());
    for ((dst, src), mask) in out.pixels_mut().zip(original.pixels()).zip(lesion_mask.pixels()) {
        let color = jet(mask[0] as f32 / 255.0);
        for c in 0..3 {
            let blended = ORIGINAL_WEIGHT * src[c] as f32 + OVERLAY_WEIGHT * color[c] as f32;
            dst[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Jpeg)?;
    Ok(buffer.into_inner())
}

/// `analysis/{base}_{type}_{timestamp}_{8 hex chars}.jpg` where `base` is the
/// file stem of the analyzed object's key.
pub fn artifact_key(image_key: &str, image_type: DerivedImageType, timestamp: &str) -> String {
    let file_name = image_key.rsplit('/').next().unwrap_or(image_key);
    let base = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _)| stem);
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}_{}_{}_{}.jpg",
        ARTIFACT_PREFIX,
        base,
        image_type,
        timestamp,
        &suffix[..8]
    )
}

/// Renders and uploads the per-image analysis artifacts.
pub struct ArtifactPublisher<S: ObjectStore> {
    store: Arc<S>,
    bucket: String,
}

impl<S: ObjectStore> ArtifactPublisher<S> {
    pub fn new(store: Arc<S>, bucket: String) -> Self {
        Self { store, bucket }
    }

    /// Uploads the isolated leaf and the lesion overlay. Failures are logged
    /// and leave the corresponding entry out of the returned list.
    pub async fn publish(
        &self,
        image_key: &str,
        original: &RgbImage,
        leaf_only: &RgbImage,
        lesion_mask: &GrayImage,
    ) -> Vec<DerivedImage> {
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let overlay = render_overlay(original, lesion_mask);
        let renders = [
            (DerivedImageType::IsolatedLeaf, leaf_only),
            (DerivedImageType::LesionOverlay, &overlay),
        ];

        let mut published = Vec::with_capacity(renders.len());
        for (image_type, image) in renders {
            let bytes = match encode_jpeg(image) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to encode {} for {}: {}", image_type, image_key, e);
                    continue;
                }
            };
            let storage_key = artifact_key(image_key, image_type, &timestamp);
            let byte_size = bytes.len() as u64;
            if !self
                .store
                .upload(&self.bucket, &storage_key, bytes, "image/jpeg")
                .await
            {
                log::error!("Failed to upload {} for {}", image_type, image_key);
                continue;
            }
            published.push(DerivedImage {
                image_type,
                storage_key,
                width: image.width(),
                height: image.height(),
                byte_size,
                created_at: timestamp.clone(),
            });
        }
        published
    }
}
