use std::sync::Arc;
use std::time::Duration;

use crate::db::models::{AiResult, NewAiResult};
use crate::db::{RepositoryError, ResultRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
}

/// How often a result write is attempted before the placeholder fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff::None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("A result already exists for application {application_id} and user {user_id}")]
    Duplicate {
        application_id: String,
        user_id: String,
    },
    #[error("No result could be saved for application {application_id}: {reason}")]
    Exhausted {
        application_id: String,
        reason: String,
    },
}

/// Writes one result per submission: bounded retries of the full record,
/// then a placeholder record, then a critical log.
pub struct PersistenceCoordinator<R: ResultRepository> {
    repository: Arc<R>,
    policy: RetryPolicy,
}

impl<R: ResultRepository> PersistenceCoordinator<R> {
    pub fn new(repository: Arc<R>, policy: RetryPolicy) -> Self {
        Self { repository, policy }
    }

    pub async fn persist(&self, record: NewAiResult) -> Result<AiResult, PersistenceError> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.repository.insert_with_children(&record).await {
                Ok(stored) => return Ok(stored),
                Err(RepositoryError::Duplicate { .. }) => {
                    log::warn!(
                        "Result for application {} and user {} already exists",
                        record.application_id,
                        record.user_id
                    );
                    return Err(PersistenceError::Duplicate {
                        application_id: record.application_id.clone(),
                        user_id: record.user_id.clone(),
                    });
                }
                Err(e) => {
                    log::error!(
                        "Attempt {}/{} to save result for application {} failed: {}",
                        attempt,
                        attempts,
                        record.application_id,
                        e
                    );
                    if attempt < attempts {
                        if let Backoff::Fixed(delay) = self.policy.backoff {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        log::warn!(
            "Saving placeholder result for application {}",
            record.application_id
        );
        match self.repository.insert_with_children(&record.placeholder()).await {
            Ok(stored) => Ok(stored),
            Err(RepositoryError::Duplicate { .. }) => Err(PersistenceError::Duplicate {
                application_id: record.application_id.clone(),
                user_id: record.user_id.clone(),
            }),
            Err(e) => {
                log::error!(
                    "CRITICAL: No result saved for application {}: {}",
                    record.application_id,
                    e
                );
                Err(PersistenceError::Exhausted {
                    application_id: record.application_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
