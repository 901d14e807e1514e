pub mod dynamodb_repository;
#[cfg(test)]
pub mod memory;
pub mod models;

use std::future::Future;

use models::{AiResult, NewAiResult};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("A result already exists for application {application_id} and user {user_id}")]
    Duplicate {
        application_id: String,
        user_id: String,
    },
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Invalid data format: {0}")]
    InvalidData(String),
    #[error("Item not found")]
    NotFound,
}

/// Store of analysis results, at most one per (application id, user id).
pub trait ResultRepository: Send + Sync + 'static {
    /// Writes the result with its top-3 predictions and analysis images as one
    /// unit. An existing result for the same pair is never overwritten.
    fn insert_with_children(
        &self,
        result: &NewAiResult,
    ) -> impl Future<Output = Result<AiResult, RepositoryError>> + Send;

    fn get_by_id(&self, id: &str) -> impl Future<Output = Result<Option<AiResult>, RepositoryError>> + Send;

    fn get_by_application_id(
        &self,
        application_id: &str,
    ) -> impl Future<Output = Result<Option<AiResult>, RepositoryError>> + Send;

    fn list_results(
        &self,
        application_id: Option<&str>,
    ) -> impl Future<Output = Result<Vec<AiResult>, RepositoryError>> + Send;
}
