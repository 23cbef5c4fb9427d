use anyhow::{Context, Result};
use domain::job::{Job, JobError, JobFile, JobMetric};
use orchestrator::{JobQueue, Orchestrator};
use std::sync::Arc;
use store::connection::TestConnectionResult;
use store::loader::TiberiusBulkLoader;
use store::repository::{JobRepository, SqlJobRepository};
use store::schema::TiberiusSchemaService;
use tokio::task::JoinHandle;
use uuid::Uuid;

///
/// Top-level facade over C7/C8/C9 (§6). One `Migrator` owns a live connection string, a
/// `SqlJobRepository`, an `Orchestrator` wired to the real `tiberius` schema/loader
/// implementations, and the single background `JobQueue` consumer - everything a caller (the
/// CLI binary, or an embedding HTTP layer out of scope here) needs to drive a migration run.
pub struct Migrator {
    connection_string: String,
    repository: Arc<dyn JobRepository>,
    orchestrator: Arc<Orchestrator>,
    queue: JobQueue,
    consumer: JoinHandle<()>,
}

impl Migrator {
    ///
    /// Connects to `connection_string`, runs schema initialization (§4.7, idempotent), and
    /// starts the job queue consumer. One `Migrator` is meant to live for the process lifetime.
    pub async fn connect(connection_string: String) -> Result<Self> {
        let repository: Arc<dyn JobRepository> = Arc::new(SqlJobRepository { connection_string: connection_string.clone() });
        repository.initialize_schema().await.context("failed to initialize control-plane schema")?;

        let schema = Arc::new(TiberiusSchemaService);
        let loader = Arc::new(TiberiusBulkLoader::default());
        let orchestrator = Arc::new(Orchestrator::new(repository.clone(), schema, loader));
        let (queue, consumer) = JobQueue::start(orchestrator.clone());

        Ok(Self { connection_string, repository, orchestrator, queue, consumer })
    }

    /// §4.5/§6 `testConnection`: does not require a running `Migrator`.
    pub async fn test_connection(connection_string: &str) -> TestConnectionResult {
        store::connection::test_connection(connection_string).await
    }

    /// §4.1/§6 `submitJob`: discovers CSV files under `root_folder` and queues the new Job.
    pub async fn submit_job(&self, root_folder: String) -> Result<Uuid> {
        let job_id = self.orchestrator.create_job(root_folder).await?;
        self.queue.submit(job_id, self.connection_string.clone());
        Ok(job_id)
    }

    /// §4.8/§6 `submitReprocessJob`: rediscovers files from the original Job's root folder.
    pub async fn submit_reprocess_job(&self, orig_job_id: Uuid) -> Result<Uuid> {
        let job_id = self.orchestrator.create_reprocess_job(orig_job_id).await?;
        self.queue.submit(job_id, self.connection_string.clone());
        Ok(job_id)
    }

    /// §4.8/§6 `submitReprocessFile`: drops the destination table and reruns one JobFile alone.
    pub async fn submit_reprocess_file(&self, orig_job_id: Uuid, file_id: Uuid) -> Result<Uuid> {
        let job_id = self.orchestrator.create_reprocess_file_job(orig_job_id, file_id, &self.connection_string).await?;
        self.queue.submit(job_id, self.connection_string.clone());
        Ok(job_id)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.repository.get_job(id).await?)
    }

    pub async fn get_all_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.repository.get_all_jobs().await?)
    }

    pub async fn get_job_file(&self, id: Uuid) -> Result<Option<JobFile>> {
        Ok(self.repository.get_job_file(id).await?)
    }

    pub async fn get_job_files(&self, job_id: Uuid) -> Result<Vec<JobFile>> {
        Ok(self.repository.get_job_files(job_id).await?)
    }

    pub async fn get_job_errors(&self, job_id: Uuid) -> Result<Vec<JobError>> {
        Ok(self.repository.get_job_errors(job_id).await?)
    }

    pub async fn get_job_metrics(&self, job_id: Uuid) -> Result<Vec<JobMetric>> {
        Ok(self.repository.get_job_metrics(job_id).await?)
    }

    /// Exposed separately from `connect` (which already runs it once) so a caller can re-run
    /// initialization on demand, per §4.7.
    pub async fn initialize_schema(&self) -> Result<()> {
        Ok(self.repository.initialize_schema().await?)
    }

    /// Stops the queue consumer from pulling new work and waits for it to drain in-flight
    /// dispatches before returning (§5 graceful shutdown).
    pub async fn shutdown(self) -> Result<()> {
        self.queue.shutdown();
        self.consumer.await.context("job queue consumer panicked")
    }
}
