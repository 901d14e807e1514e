use std::sync::Arc;

use shared::SubmissionEvent;

use super::PredictError;
use super::persistence::{PersistenceCoordinator, PersistenceError};
use crate::analysis::artifacts::ArtifactPublisher;
use crate::analysis::kernel::AnalysisKernel;
use crate::analysis::severity::SeverityEstimate;
use crate::analysis::AnalysisOutcome;
use crate::db::ResultRepository;
use crate::db::models::{AiResult, NewAiResult};
use crate::storage::{ObjectStore, StorageError, download_from_candidates};

/// What a submission's images amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// The most confident successfully analyzed image.
    Selected {
        image_key: String,
        outcome: AnalysisOutcome,
    },
    /// Nothing classified, but the first image could still be measured.
    SeverityOnly {
        image_key: String,
        severity: SeverityEstimate,
    },
    Default { image_path: Option<String> },
}

impl BatchOutcome {
    pub fn into_record(self, application_id: &str, user_id: &str) -> NewAiResult {
        match self {
            BatchOutcome::Selected { image_key, outcome } => {
                NewAiResult::from_outcome(application_id, user_id, Some(image_key), outcome)
            }
            BatchOutcome::SeverityOnly {
                image_key,
                severity,
            } => NewAiResult::default_record(application_id, user_id, Some(image_key), Some(severity)),
            BatchOutcome::Default { image_path } => {
                NewAiResult::default_record(application_id, user_id, image_path, None)
            }
        }
    }
}

/// Best-of-N analysis of a submission followed by persistence.
pub struct BatchOrchestrator<S: ObjectStore, R: ResultRepository> {
    kernel: Arc<AnalysisKernel>,
    store: Arc<S>,
    source_buckets: Vec<String>,
    upload_bucket: String,
    publisher: Option<ArtifactPublisher<S>>,
    persistence: PersistenceCoordinator<R>,
}

impl<S: ObjectStore, R: ResultRepository> BatchOrchestrator<S, R> {
    pub fn new(
        kernel: Arc<AnalysisKernel>,
        store: Arc<S>,
        source_buckets: Vec<String>,
        upload_bucket: String,
        publisher: Option<ArtifactPublisher<S>>,
        persistence: PersistenceCoordinator<R>,
    ) -> Self {
        Self {
            kernel,
            store,
            source_buckets,
            upload_bucket,
            publisher,
            persistence,
        }
    }

    /// Analyzes every key in order and keeps the first image with the
    /// strictly highest confidence. Falls back to the severity of the first
    /// image, then to an empty default.
    pub async fn select(&self, object_keys: &[String]) -> BatchOutcome {
        let Some(first_key) = object_keys.first() else {
            log::warn!("No images to analyze, using default result");
            return BatchOutcome::Default { image_path: None };
        };

        let mut best: Option<(String, AnalysisOutcome)> = None;
        for (i, key) in object_keys.iter().enumerate() {
            log::info!("Processing image {}/{}: {}", i + 1, object_keys.len(), key);
            let bytes = match download_from_candidates(self.store.as_ref(), &self.source_buckets, key).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to download image {}: {}", key, e);
                    continue;
                }
            };
            let outcome = match self.kernel.analyze(bytes, key, self.publisher.as_ref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Error processing image {}: {}", key, e);
                    continue;
                }
            };
            log::info!(
                "Processed {}: {} ({:.2}%)",
                key,
                outcome.predicted_class,
                outcome.confidence
            );
            let better = best
                .as_ref()
                .is_none_or(|(_, current)| outcome.confidence > current.confidence);
            if better {
                best = Some((key.clone(), outcome));
            }
        }

        if let Some((image_key, outcome)) = best {
            return BatchOutcome::Selected { image_key, outcome };
        }

        log::warn!("No image could be classified, estimating severity from {}", first_key);
        let severity = match download_from_candidates(self.store.as_ref(), &self.source_buckets, first_key).await {
            Ok(bytes) => match self.kernel.severity_only(bytes).await {
                Ok(severity) => Some(severity),
                Err(e) => {
                    log::warn!("Severity estimation failed for {}: {}", first_key, e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to download image {}: {}", first_key, e);
                None
            }
        };
        match severity {
            Some(severity) => BatchOutcome::SeverityOnly {
                image_key: first_key.clone(),
                severity,
            },
            None => BatchOutcome::Default {
                image_path: Some(first_key.clone()),
            },
        }
    }

    /// Analyzes a submission and stores exactly one result for it.
    pub async fn process(&self, event: &SubmissionEvent) -> Result<AiResult, PersistenceError> {
        log::info!(
            "Processing submission {} with {} images",
            event.submission_id,
            event.object_keys.len()
        );
        let record = self
            .select(&event.object_keys)
            .await
            .into_record(&event.submission_id, &event.user_id);
        self.persistence.persist(record).await
    }

    /// Stores an uploaded image under `image_key`, analyzes it and saves the
    /// result.
    pub async fn predict_upload(
        &self,
        application_id: &str,
        user_id: &str,
        image_key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<AiResult, PredictError> {
        if !self
            .store
            .upload(&self.upload_bucket, image_key, bytes.clone(), content_type)
            .await
        {
            return Err(StorageError::S3(format!("failed to store {}", image_key)).into());
        }
        let outcome = self
            .kernel
            .analyze(bytes, image_key, self.publisher.as_ref())
            .await?;
        let record = NewAiResult::from_outcome(application_id, user_id, Some(image_key.to_string()), outcome);
        Ok(self.persistence.persist(record).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analysis::artifacts::encode_jpeg;
    use crate::analysis::classifier::tests::StubModel;
    use crate::analysis::kernel::tests::{kernel_with, leaf_with_spot, png_bytes};
    use crate::analysis::AnalysisError;
    use crate::config::AnalysisConfig;
    use crate::db::memory::MemoryRepository;
    use crate::orchestration::persistence::RetryPolicy;
    use crate::storage::memory::MemoryStore;
    use shared::{DiseaseClass, UNKNOWN_CLASS};

    pub(crate) const UPLOAD_BUCKET: &str = "ai-service-bucket";

    pub(crate) fn buckets() -> Vec<String> {
        vec!["documents".to_string(), UPLOAD_BUCKET.to_string()]
    }

    pub(crate) fn orchestrator(
        kernel: Arc<AnalysisKernel>,
        store: Arc<MemoryStore>,
        repository: Arc<MemoryRepository>,
        publish: bool,
    ) -> BatchOrchestrator<MemoryStore, MemoryRepository> {
        let publisher = publish.then(|| ArtifactPublisher::new(store.clone(), UPLOAD_BUCKET.to_string()));
        BatchOrchestrator::new(
            kernel,
            store,
            buckets(),
            UPLOAD_BUCKET.to_string(),
            publisher,
            PersistenceCoordinator::new(repository, RetryPolicy::default()),
        )
    }

    fn event(keys: &[&str]) -> SubmissionEvent {
        SubmissionEvent {
            submission_id: "app-1".to_string(),
            user_id: "user-1".to_string(),
            object_keys: keys.iter().map(|k| k.to_string()).collect(),
            provider: Some("PCIC".to_string()),
        }
    }

    #[tokio::test]
    async fn test_no_keys_stores_default_result() {
        let store = Arc::new(MemoryStore::default());
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![StubModel::scores(DiseaseClass::Normal, 0.9)]);
        let orchestrator = orchestrator(kernel, store, repository.clone(), false);

        let stored = orchestrator.process(&event(&[])).await.unwrap();
        assert_eq!(stored.result, UNKNOWN_CLASS);
        assert_eq!(stored.confidence, 0.0);
        assert_eq!(stored.severity, 0.0);
        assert_eq!(stored.image_path, None);
        let top3: Vec<(String, f64, u8)> = stored
            .top3_predictions
            .iter()
            .map(|p| (p.class_name.clone(), p.confidence, p.rank))
            .collect();
        assert_eq!(
            top3,
            vec![
                (UNKNOWN_CLASS.to_string(), 0.0, 1),
                (UNKNOWN_CLASS.to_string(), 0.0, 2),
                (UNKNOWN_CLASS.to_string(), 0.0, 3),
            ]
        );
        assert_eq!(repository.all().len(), 1);
    }

    #[tokio::test]
    async fn test_single_image_is_selected_and_stored() {
        let store = Arc::new(MemoryStore::default());
        store.insert("documents", "sub/leaf.png", png_bytes(&leaf_with_spot()));
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![StubModel::scores(DiseaseClass::BrownSpot, 0.453)]);
        let orchestrator = orchestrator(kernel, store.clone(), repository, true);

        let stored = orchestrator.process(&event(&["sub/leaf.png"])).await.unwrap();
        assert_eq!(stored.result, "brown_spot");
        assert!((stored.confidence - 84.3).abs() < 1e-4);
        assert_eq!(stored.accuracy, "84.30%");
        assert!(stored.prediction.starts_with("Disease: brown_spot, Severity: "));
        assert_eq!(stored.image_path.as_deref(), Some("sub/leaf.png"));
        assert_eq!(stored.leaf_analysis_images.len(), 2);
        assert!(stored.leaf_area > 0.0);
        assert!(stored.severity > 0.0 && stored.severity <= 100.0);
        assert_eq!(store.keys(UPLOAD_BUCKET).len(), 2);
    }

    #[tokio::test]
    async fn test_most_confident_image_wins() {
        let store = Arc::new(MemoryStore::default());
        store.insert("documents", "one.png", png_bytes(&leaf_with_spot()));
        store.insert(UPLOAD_BUCKET, "two.png", png_bytes(&leaf_with_spot()));
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![
            StubModel::scores(DiseaseClass::NeckBlast, 0.20),
            StubModel::scores(DiseaseClass::LeafScald, 0.70),
        ]);
        let orchestrator = orchestrator(kernel, store, repository, false);

        let outcome = orchestrator
            .select(&["one.png".to_string(), "two.png".to_string()])
            .await;
        match outcome {
            BatchOutcome::Selected { image_key, outcome } => {
                assert_eq!(image_key, "two.png");
                assert_eq!(outcome.predicted_class, "leaf_scald");
                assert!((outcome.confidence - 97.0).abs() < 1e-3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ties_keep_the_first_image() {
        let store = Arc::new(MemoryStore::default());
        store.insert("documents", "one.png", png_bytes(&leaf_with_spot()));
        store.insert("documents", "two.png", png_bytes(&leaf_with_spot()));
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![
            StubModel::scores(DiseaseClass::BrownSpot, 0.5),
            StubModel::scores(DiseaseClass::DownyMildew, 0.5),
        ]);
        let orchestrator = orchestrator(kernel, store, repository, false);

        let outcome = orchestrator
            .select(&["one.png".to_string(), "two.png".to_string()])
            .await;
        assert!(matches!(
            outcome,
            BatchOutcome::Selected { ref image_key, .. } if image_key == "one.png"
        ));
    }

    #[tokio::test]
    async fn test_failed_images_are_skipped() {
        let store = Arc::new(MemoryStore::default());
        store.insert("documents", "broken.png", b"not an image".to_vec());
        store.insert("documents", "good.jpg", encode_jpeg(&leaf_with_spot()).unwrap());
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![StubModel::scores(DiseaseClass::Normal, 0.9)]);
        let orchestrator = orchestrator(kernel, store, repository, false);

        let keys = ["missing.png", "broken.png", "good.jpg"].map(String::from);
        match orchestrator.select(&keys).await {
            BatchOutcome::Selected { image_key, .. } => assert_eq!(image_key, "good.jpg"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_images_store_default_with_first_key() {
        let store = Arc::new(MemoryStore::default());
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![StubModel::scores(DiseaseClass::Normal, 0.9)]);
        let orchestrator = orchestrator(kernel, store.clone(), repository, false);

        let stored = orchestrator
            .process(&event(&["first.jpg", "second.jpg"]))
            .await
            .unwrap();
        assert_eq!(stored.result, UNKNOWN_CLASS);
        assert_eq!(stored.confidence, 0.0);
        assert_eq!(stored.severity, 0.0);
        assert_eq!(stored.image_path.as_deref(), Some("first.jpg"));
        assert_eq!(stored.top3_predictions.len(), 3);
        assert!(stored.leaf_analysis_images.is_empty());
        let first_downloads = store
            .downloaded_keys()
            .iter()
            .filter(|k| k.as_str() == "first.jpg")
            .count();
        assert_eq!(first_downloads, buckets().len() * 2);
    }

    #[tokio::test]
    async fn test_missing_model_falls_back_to_severity() {
        let store = Arc::new(MemoryStore::default());
        store.insert("documents", "leaf.png", png_bytes(&leaf_with_spot()));
        let repository = Arc::new(MemoryRepository::default());
        let kernel = Arc::new(AnalysisKernel::new(&AnalysisConfig::default(), None));
        let orchestrator = orchestrator(kernel, store, repository, true);

        let outcome = orchestrator.select(&["leaf.png".to_string()]).await;
        let severity = match &outcome {
            BatchOutcome::SeverityOnly { image_key, severity } => {
                assert_eq!(image_key, "leaf.png");
                *severity
            }
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(severity.leaf_area, 64 * 64);
        assert!(severity.lesion_area > 0);

        let record = outcome.into_record("app-1", "user-1");
        assert_eq!(record.result, UNKNOWN_CLASS);
        assert_eq!(record.confidence, 0.0);
        assert_eq!(record.severity, severity.lesion_ratio);
        assert!(record.leaf_analysis_images.is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_submission_is_not_stored_twice() {
        let store = Arc::new(MemoryStore::default());
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![StubModel::scores(DiseaseClass::Normal, 0.9)]);
        let orchestrator = orchestrator(kernel, store, repository.clone(), false);

        orchestrator.process(&event(&[])).await.unwrap();
        let err = orchestrator.process(&event(&[])).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Duplicate { .. }));
        assert_eq!(repository.all().len(), 1);
    }

    #[tokio::test]
    async fn test_predict_upload_stores_image_and_result() {
        let store = Arc::new(MemoryStore::default());
        let repository = Arc::new(MemoryRepository::default());
        let kernel = kernel_with(vec![StubModel::scores(DiseaseClass::BrownSpot, 0.453)]);
        let orchestrator = orchestrator(kernel, store.clone(), repository, false);

        let key = "applications/app-1/leaf.png";
        let stored = orchestrator
            .predict_upload("app-1", "user-1", key, png_bytes(&leaf_with_spot()), "image/png")
            .await
            .unwrap();
        assert_eq!(stored.image_path.as_deref(), Some(key));
        assert_eq!(store.get(UPLOAD_BUCKET, key).map(|(_, ct)| ct).as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_predict_upload_reports_analysis_failure() {
        let store = Arc::new(MemoryStore::default());
        let repository = Arc::new(MemoryRepository::default());
        let kernel = Arc::new(AnalysisKernel::new(&AnalysisConfig::default(), None));
        let orchestrator = orchestrator(kernel, store, repository.clone(), false);

        let err = orchestrator
            .predict_upload("app-1", "user-1", "applications/app-1/leaf.png", png_bytes(&leaf_with_spot()), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, PredictError::Analysis(AnalysisError::ModelUnavailable)));
        assert!(repository.all().is_empty());
    }
}
