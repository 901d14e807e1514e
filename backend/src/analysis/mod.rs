pub mod artifacts;
pub mod classifier;
pub mod color;
pub mod damage;
pub mod kernel;
pub mod segmentation;
pub mod severity;
pub mod superpixel;
#[cfg(feature = "torch")]
pub mod torch_model;
pub mod vision;

use strum_macros::{AsRefStr, Display};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("No disease model is loaded")]
    ModelUnavailable,
    #[error("Failed to load disease model: {0}")]
    ModelLoad(String),
    #[error("Image processing failed: {0}")]
    Vision(#[from] opencv::Error),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// One of the three best classes of a classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassPrediction {
    pub class_name: String,
    /// Percentage in `[0, 100]`.
    pub confidence: f64,
    pub rank: u8,
}

impl ClassPrediction {
    /// The three rank-ordered placeholders used when nothing was classified.
    pub fn unknown_top3() -> [ClassPrediction; 3] {
        std::array::from_fn(|i| ClassPrediction {
            class_name: shared::UNKNOWN_CLASS.to_string(),
            confidence: 0.0,
            rank: i as u8 + 1,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DerivedImageType {
    IsolatedLeaf,
    LesionOverlay,
}

/// A rendered analysis image that was uploaded to the object store.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedImage {
    pub image_type: DerivedImageType,
    pub storage_key: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub created_at: String,
}

/// Full result of analyzing one image.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub predicted_class: String,
    pub confidence: f64,
    pub lesion_area: u64,
    pub leaf_area: u64,
    pub lesion_ratio: f64,
    pub top3: [ClassPrediction; 3],
    pub derived_images: Vec<DerivedImage>,
}
