use std::sync::Arc;

use shared::SubmissionEvent;
use tokio::sync::mpsc;

use super::batch_orchestrator::BatchOrchestrator;
use crate::db::ResultRepository;
use crate::storage::ObjectStore;

/// Parses a raw event and applies the provider filter. An empty `providers`
/// list accepts every provider.
pub fn accept_event(payload: &[u8], providers: &[String]) -> Option<SubmissionEvent> {
    let event: SubmissionEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            log::info!("Skipping malformed submission event: {}", e);
            return None;
        }
    };
    if !providers.is_empty() {
        let accepted = event
            .provider
            .as_ref()
            .is_some_and(|provider| providers.iter().any(|p| p == provider));
        if !accepted {
            log::info!(
                "Skipping submission {} from provider {}",
                event.submission_id,
                event.provider.as_deref().unwrap_or("Unknown")
            );
            return None;
        }
    }
    Some(event)
}

/// Consumes submission events one at a time until every sender is dropped.
pub async fn run<S: ObjectStore, R: ResultRepository>(
    orchestrator: Arc<BatchOrchestrator<S, R>>,
    mut events: mpsc::Receiver<Vec<u8>>,
    providers: Vec<String>,
) {
    log::info!("Submission worker started");
    while let Some(payload) = events.recv().await {
        let Some(event) = accept_event(&payload, &providers) else {
            continue;
        };
        match orchestrator.process(&event).await {
            Ok(stored) => log::info!(
                "Submission {} stored as result {}: {} ({}), severity {:.2}%",
                event.submission_id,
                stored.id,
                stored.result,
                stored.accuracy,
                stored.severity
            ),
            Err(e) => log::error!("Submission {} not stored: {}", event.submission_id, e),
        }
    }
    log::info!("Submission worker stopped");
}
