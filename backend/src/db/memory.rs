use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use super::models::{AiResult, NewAiResult};
use super::{RepositoryError, ResultRepository};

/// In-process result store for tests. Inserts can be made to fail a given
/// number of times before succeeding.
#[derive(Default)]
pub struct MemoryRepository {
    results: Mutex<Vec<AiResult>>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryRepository {
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn all(&self) -> Vec<AiResult> {
        self.results.lock().unwrap().clone()
    }
}

impl ResultRepository for MemoryRepository {
    async fn insert_with_children(&self, result: &NewAiResult) -> Result<AiResult, RepositoryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::DynamoDb("transaction failed".to_string()));
        }

        let mut results = self.results.lock().unwrap();
        if results
            .iter()
            .any(|r| r.application_id == result.application_id && r.user_id == result.user_id)
        {
            return Err(RepositoryError::Duplicate {
                application_id: result.application_id.clone(),
                user_id: result.user_id.clone(),
            });
        }
        let stored = result.clone().into_stored(format!("r-{}", results.len() + 1));
        results.push(stored.clone());
        Ok(stored)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<AiResult>, RepositoryError> {
        Ok(self.results.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn get_by_application_id(
        &self,
        application_id: &str,
    ) -> Result<Option<AiResult>, RepositoryError> {
        Ok(self
            .results
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.application_id == application_id)
            .cloned())
    }

    async fn list_results(&self, application_id: Option<&str>) -> Result<Vec<AiResult>, RepositoryError> {
        Ok(self
            .results
            .lock()
            .unwrap()
            .iter()
            .filter(|r| application_id.is_none_or(|app| r.application_id == app))
            .cloned()
            .collect())
    }
}
