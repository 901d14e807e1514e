use std::collections::BTreeMap;

use shared::{AiResultDto, AnalysisImageDto, PredictionStatistics, Top3PredictionDto, UNKNOWN_CLASS};

use crate::analysis::severity::SeverityEstimate;
use crate::analysis::{AnalysisOutcome, ClassPrediction};

pub const NO_ANALYSIS_PREDICTION: &str = "Disease: Unknown - No image analysis performed";
pub const ZERO_ACCURACY: &str = "0.00%";

#[derive(Debug, Clone, PartialEq)]
pub struct Top3Prediction {
    pub class_name: String,
    pub confidence: f64,
    pub rank: u8,
}

impl From<ClassPrediction> for Top3Prediction {
    fn from(prediction: ClassPrediction) -> Self {
        Self {
            class_name: prediction.class_name,
            confidence: prediction.confidence,
            rank: prediction.rank,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafAnalysisImage {
    pub image_type: String,
    pub image_path: String,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub created_at: String,
}

/// A result that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAiResult {
    pub application_id: String,
    pub user_id: String,
    pub result: String,
    pub prediction: String,
    pub accuracy: String,
    pub confidence: f64,
    pub severity: f64,
    pub lesion_area: f64,
    pub leaf_area: f64,
    pub image_path: Option<String>,
    pub top3_predictions: Vec<Top3Prediction>,
    pub leaf_analysis_images: Vec<LeafAnalysisImage>,
}

pub fn prediction_text(class_name: &str, lesion_ratio: f64) -> String {
    format!("Disease: {}, Severity: {:.2}%", class_name, lesion_ratio)
}

pub fn accuracy_text(confidence: f64) -> String {
    format!("{:.2}%", confidence)
}

fn unknown_top3() -> Vec<Top3Prediction> {
    ClassPrediction::unknown_top3()
        .into_iter()
        .map(Top3Prediction::from)
        .collect()
}

impl NewAiResult {
    /// Result of a fully analyzed image.
    pub fn from_outcome(
        application_id: &str,
        user_id: &str,
        image_path: Option<String>,
        outcome: AnalysisOutcome,
    ) -> Self {
        Self {
            application_id: application_id.to_string(),
            user_id: user_id.to_string(),
            prediction: prediction_text(&outcome.predicted_class, outcome.lesion_ratio),
            accuracy: accuracy_text(outcome.confidence),
            result: outcome.predicted_class,
            confidence: outcome.confidence,
            severity: outcome.lesion_ratio,
            lesion_area: outcome.lesion_area as f64,
            leaf_area: outcome.leaf_area as f64,
            image_path,
            top3_predictions: outcome.top3.into_iter().map(Top3Prediction::from).collect(),
            leaf_analysis_images: outcome
                .derived_images
                .into_iter()
                .map(|image| LeafAnalysisImage {
                    image_type: image.image_type.to_string(),
                    image_path: image.storage_key,
                    width: image.width,
                    height: image.height,
                    file_size: image.byte_size,
                    created_at: image.created_at,
                })
                .collect(),
        }
    }

    /// "Unknown" result, carrying the severity measured on the first image
    /// when that much could still be computed.
    pub fn default_record(
        application_id: &str,
        user_id: &str,
        image_path: Option<String>,
        severity: Option<SeverityEstimate>,
    ) -> Self {
        let severity_values = severity.unwrap_or_default();
        let prediction = match severity {
            Some(estimate) => prediction_text(UNKNOWN_CLASS, estimate.lesion_ratio),
            None => NO_ANALYSIS_PREDICTION.to_string(),
        };
        Self {
            application_id: application_id.to_string(),
            user_id: user_id.to_string(),
            result: UNKNOWN_CLASS.to_string(),
            prediction,
            accuracy: ZERO_ACCURACY.to_string(),
            confidence: 0.0,
            severity: severity_values.lesion_ratio,
            lesion_area: severity_values.lesion_area as f64,
            leaf_area: severity_values.leaf_area as f64,
            image_path,
            top3_predictions: unknown_top3(),
            leaf_analysis_images: Vec::new(),
        }
    }

    /// Minimal record for the same submission: identity and image path only.
    pub fn placeholder(&self) -> Self {
        Self::default_record(
            &self.application_id,
            &self.user_id,
            self.image_path.clone(),
            None,
        )
    }

    pub fn into_stored(self, id: String) -> AiResult {
        AiResult {
            id,
            application_id: self.application_id,
            user_id: self.user_id,
            result: self.result,
            prediction: self.prediction,
            accuracy: self.accuracy,
            confidence: self.confidence,
            severity: self.severity,
            lesion_area: self.lesion_area,
            leaf_area: self.leaf_area,
            image_path: self.image_path,
            top3_predictions: self.top3_predictions,
            leaf_analysis_images: self.leaf_analysis_images,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiResult {
    pub id: String,
    pub application_id: String,
    pub user_id: String,
    pub result: String,
    pub prediction: String,
    pub accuracy: String,
    pub confidence: f64,
    pub severity: f64,
    pub lesion_area: f64,
    pub leaf_area: f64,
    pub image_path: Option<String>,
    pub top3_predictions: Vec<Top3Prediction>,
    pub leaf_analysis_images: Vec<LeafAnalysisImage>,
}

impl AiResult {
    /// Wire form without any presigned URLs; callers mint those per request.
    pub fn into_dto(self) -> AiResultDto {
        AiResultDto {
            id: self.id,
            result: self.result,
            application_id: self.application_id,
            user_id: self.user_id,
            prediction: self.prediction,
            accuracy: self.accuracy,
            confidence: self.confidence,
            severity: self.severity,
            lesion_area: self.lesion_area,
            leaf_area: self.leaf_area,
            image_path: self.image_path,
            original_image_url: None,
            top3_predictions: self
                .top3_predictions
                .into_iter()
                .map(|p| Top3PredictionDto {
                    class_name: p.class_name,
                    confidence: p.confidence,
                    rank: p.rank,
                })
                .collect(),
            leaf_analysis_images: self
                .leaf_analysis_images
                .into_iter()
                .map(|image| AnalysisImageDto {
                    image_type: image.image_type,
                    image_path: image.image_path,
                    presigned_url: None,
                    width: image.width,
                    height: image.height,
                    file_size: image.file_size,
                    created_at: image.created_at,
                })
                .collect(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Aggregates over stored results. Confidence is averaged from the accuracy
/// text, leaving out zero and unparsable entries.
pub fn compute_statistics(results: &[AiResult]) -> PredictionStatistics {
    if results.is_empty() {
        return PredictionStatistics::default();
    }

    let mut disease_distribution = BTreeMap::new();
    let mut unknown_predictions = 0u64;
    let mut confidences = Vec::new();
    for result in results {
        if result.result == UNKNOWN_CLASS {
            unknown_predictions += 1;
        } else {
            *disease_distribution.entry(result.result.clone()).or_insert(0u64) += 1;
        }
        if result.accuracy != ZERO_ACCURACY {
            if let Ok(confidence) = result.accuracy.trim_end_matches('%').trim().parse::<f64>() {
                confidences.push(confidence);
            }
        }
    }

    let total = results.len() as u64;
    let average_confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    PredictionStatistics {
        total_predictions: total,
        disease_distribution,
        average_confidence: round2(average_confidence),
        unknown_predictions,
        success_rate: round2((total - unknown_predictions) as f64 / total as f64 * 100.0),
    }
}
