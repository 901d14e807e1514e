use std::sync::Arc;

use actix_web::rt::task;
use image::{GrayImage, RgbImage};

use super::artifacts::ArtifactPublisher;
use super::classifier::{Classification, DiseaseClassifier, DiseaseModel};
use super::damage::DamageDetector;
use super::segmentation::LeafSegmenter;
use super::severity::{SeverityCalculator, SeverityEstimate};
use super::{AnalysisError, AnalysisOutcome};
use crate::config::AnalysisConfig;
use crate::storage::ObjectStore;

/// Everything computed for one image before artifacts are published.
pub struct Inspection {
    pub original: RgbImage,
    pub leaf_only: RgbImage,
    pub lesion_mask: GrayImage,
    pub severity: SeverityEstimate,
    pub classification: Classification,
}

/// Leaf segmentation, lesion detection, severity and classification of a
/// single image.
pub struct AnalysisKernel {
    segmenter: LeafSegmenter,
    detector: DamageDetector,
    classifier: DiseaseClassifier,
}

impl AnalysisKernel {
    pub fn new(config: &AnalysisConfig, model: Option<Arc<dyn DiseaseModel>>) -> Self {
        Self {
            segmenter: LeafSegmenter::new(config.enhancement.clone(), config.segmentation.clone()),
            detector: DamageDetector::new(config.damage.clone(), config.superpixel.clone()),
            classifier: DiseaseClassifier::new(model, &config.classifier),
        }
    }

    pub fn has_model(&self) -> bool {
        self.classifier.is_loaded()
    }

    pub fn decode(bytes: &[u8]) -> Result<RgbImage, AnalysisError> {
        Ok(image::load_from_memory(bytes)?.to_rgb8())
    }

    fn measure(
        &self,
        image: &RgbImage,
    ) -> Result<(RgbImage, GrayImage, SeverityEstimate), AnalysisError> {
        let segmentation = self.segmenter.segment(image)?;
        if segmentation.whole_frame {
            log::warn!("No leaf isolated, measuring the whole frame");
        }
        let lesion_mask = self.detector.detect(&segmentation)?;
        let severity = SeverityCalculator::compute(&lesion_mask, &segmentation.leaf_mask);
        log::info!(
            "Lesion area {} px of leaf area {} px ({:.2}%)",
            severity.lesion_area,
            severity.leaf_area,
            severity.lesion_ratio
        );
        Ok((segmentation.leaf_only, lesion_mask, severity))
    }

    /// Segment, detect, measure and classify one encoded image.
    pub fn inspect(&self, bytes: &[u8]) -> Result<Inspection, AnalysisError> {
        if !self.classifier.is_loaded() {
            return Err(AnalysisError::ModelUnavailable);
        }
        let original = Self::decode(bytes)?;
        let (leaf_only, lesion_mask, severity) = self.measure(&original)?;
        let classification = self.classifier.classify(&leaf_only)?;
        Ok(Inspection {
            original,
            leaf_only,
            lesion_mask,
            severity,
            classification,
        })
    }

    /// The measuring half of `inspect`; never touches the model.
    pub fn estimate_severity(&self, bytes: &[u8]) -> Result<SeverityEstimate, AnalysisError> {
        let original = Self::decode(bytes)?;
        let (_, _, severity) = self.measure(&original)?;
        Ok(severity)
    }

    /// Full analysis on the blocking pool, then artifact publishing when a
    /// publisher is given.
    pub async fn analyze<S: ObjectStore>(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        image_key: &str,
        publisher: Option<&ArtifactPublisher<S>>,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let kernel = Arc::clone(self);
        let inspection = task::spawn_blocking(move || kernel.inspect(&bytes))
            .await
            .map_err(|e| AnalysisError::Inference(format!("analysis task failed: {}", e)))??;

        let derived_images = match publisher {
            Some(publisher) => {
                publisher
                    .publish(
                        image_key,
                        &inspection.original,
                        &inspection.leaf_only,
                        &inspection.lesion_mask,
                    )
                    .await
            }
            None => Vec::new(),
        };

        let Inspection {
            severity,
            classification,
            ..
        } = inspection;
        Ok(AnalysisOutcome {
            predicted_class: classification.predicted_class,
            confidence: classification.confidence,
            lesion_area: severity.lesion_area,
            leaf_area: severity.leaf_area,
            lesion_ratio: severity.lesion_ratio,
            top3: classification.top3,
            derived_images,
        })
    }

    pub async fn severity_only(self: &Arc<Self>, bytes: Vec<u8>) -> Result<SeverityEstimate, AnalysisError> {
        let kernel = Arc::clone(self);
        task::spawn_blocking(move || kernel.estimate_severity(&bytes))
            .await
            .map_err(|e| AnalysisError::Inference(format!("severity task failed: {}", e)))?
    }
}
