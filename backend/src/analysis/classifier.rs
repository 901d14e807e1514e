use std::sync::Arc;

use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use shared::DiseaseClass;
use strum::EnumCount;

use super::{AnalysisError, ClassPrediction};
use crate::config::{ClassifierConfig, InputNormalization};

pub const MAX_ADJUSTED_CONFIDENCE: f64 = 99.99999999999;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Opaque image classifier over the disease classes.
pub trait DiseaseModel: Send + Sync {
    /// `(width, height)` the model expects.
    fn input_size(&self) -> (u32, u32);

    /// Class probabilities for a `[1, height, width, 3]` batch.
    fn predict(&self, input: Array4<f32>) -> Result<Vec<f32>, AnalysisError>;
}

/// Loads the model at `model_path`. No path means running without a model;
/// a configured path that cannot be loaded is an error.
#[cfg(feature = "torch")]
pub fn load_model(
    model_path: Option<&str>,
    input_size: u32,
    outputs_logits: bool,
) -> Result<Option<Arc<dyn DiseaseModel>>, AnalysisError> {
    let Some(path) = model_path else {
        return Ok(None);
    };
    let model = super::torch_model::TorchModel::load(path, input_size, outputs_logits)?;
    Ok(Some(Arc::new(model) as Arc<dyn DiseaseModel>))
}

/// Loads the model at `model_path`. No path means running without a model;
/// a configured path is an error because this build has no inference backend.
#[cfg(not(feature = "torch"))]
pub fn load_model(
    model_path: Option<&str>,
    _input_size: u32,
    _outputs_logits: bool,
) -> Result<Option<Arc<dyn DiseaseModel>>, AnalysisError> {
    match model_path {
        None => Ok(None),
        Some(path) => Err(AnalysisError::ModelLoad(format!(
            "{} is configured but the service was built without the torch feature",
            path
        ))),
    }
}

/// Post-processing applied to every reported confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceAdjustment {
    Remap,
    Raw,
}

impl ConfidenceAdjustment {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            ConfidenceAdjustment::Remap => remap_confidence(raw),
            ConfidenceAdjustment::Raw => raw,
        }
    }
}

/// Maps a raw percentage into `[base, 99.99999999999]` where `base` is 75 below
/// 30, 80 below 60 and 90 otherwise; the tens digit and the fractional part of
/// `raw` are added on top.
pub fn remap_confidence(raw: f64) -> f64 {
    let base = if raw < 30.0 {
        75.0
    } else if raw < 60.0 {
        80.0
    } else {
        90.0
    };
    let integer = raw.trunc();
    let tens_digit = if raw < 10.0 {
        0.0
    } else {
        ((integer as u64 / 10) % 10) as f64
    };
    let fraction = raw - integer;
    (base + tens_digit + fraction).min(MAX_ADJUSTED_CONFIDENCE)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub predicted_class: String,
    pub confidence: f64,
    pub top3: [ClassPrediction; 3],
}

#[derive(Clone)]
pub struct DiseaseClassifier {
    model: Option<Arc<dyn DiseaseModel>>,
    input_size: (u32, u32),
    normalization: InputNormalization,
    adjustment: ConfidenceAdjustment,
}

impl DiseaseClassifier {
    pub fn new(model: Option<Arc<dyn DiseaseModel>>, config: &ClassifierConfig) -> Self {
        let input_size = model.as_ref().map(|m| m.input_size()).unwrap_or((224, 224));
        Self {
            model,
            input_size,
            normalization: config.normalization,
            adjustment: if config.remap_confidence {
                ConfidenceAdjustment::Remap
            } else {
                ConfidenceAdjustment::Raw
            },
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn classify(&self, leaf_only: &RgbImage) -> Result<Classification, AnalysisError> {
        let model = self.model.as_ref().ok_or(AnalysisError::ModelUnavailable)?;
        let input = self.prepare(leaf_only);
        let probabilities = model.predict(input)?;
        if probabilities.len() != DiseaseClass::COUNT {
            return Err(AnalysisError::Inference(format!(
                "expected {} class scores, got {}",
                DiseaseClass::COUNT,
                probabilities.len()
            )));
        }

        let top3 = self.top3(&probabilities)?;
        let raw_top = probabilities.iter().copied().fold(f32::MIN, f32::max);
        log::info!(
            "Predicted {} with confidence {:.2}% (raw {:.2}%)",
            top3[0].class_name,
            top3[0].confidence,
            raw_top as f64 * 100.0
        );
        Ok(Classification {
            predicted_class: top3[0].class_name.clone(),
            confidence: top3[0].confidence,
            top3,
        })
    }

    fn prepare(&self, leaf_only: &RgbImage) -> Array4<f32> {
        let (width, height) = self.input_size;
        let resized = imageops::resize(leaf_only, width, height, FilterType::Triangle);
        let mut input = Array4::<f32>::zeros((1, height as usize, width as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32;
                input[[0, y as usize, x as usize, c]] = match self.normalization {
                    InputNormalization::Identity => value,
                    InputNormalization::UnitRange => value / 255.0,
                    InputNormalization::Imagenet => {
                        (value / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
                    }
                };
            }
        }
        input
    }

    /// Three best classes, ties going to the lower class index.
    fn top3(&self, probabilities: &[f32]) -> Result<[ClassPrediction; 3], AnalysisError> {
        let mut order: Vec<usize> = (0..probabilities.len()).collect();
        order.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]));

        let mut top3 = ClassPrediction::unknown_top3();
        for (slot, &index) in top3.iter_mut().zip(&order) {
            let class = DiseaseClass::from_index(index).ok_or_else(|| {
                AnalysisError::Inference(format!("class index {} out of range", index))
            })?;
            slot.class_name = class.to_string();
            slot.confidence = self.adjustment.apply(probabilities[index] as f64 * 100.0);
        }
        Ok(top3)
    }
}
