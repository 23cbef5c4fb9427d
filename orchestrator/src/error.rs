use thiserror::Error;
use uuid::Uuid;

///
/// Orchestrator-level failures (§7 kind "Other"). A `Failed` job records one of these as a
/// JobError(Other) with the exception message and re-surfaces the error to the queue consumer,
/// which logs it but does not die.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("JobFile {id} not found")]
    JobFileNotFound { id: Uuid },

    #[error(transparent)]
    Ingest(#[from] ingest::IngestError),

    #[error(transparent)]
    Store(#[from] store::StoreError),
}
