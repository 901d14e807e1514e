pub mod batch_orchestrator;
pub mod persistence;
pub mod worker;

use crate::analysis::AnalysisError;
use crate::storage::StorageError;
use persistence::PersistenceError;

/// Failure of a synchronous upload-and-predict request.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
