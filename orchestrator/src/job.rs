use crate::error::OrchestratorError;
use chrono::Utc;
use domain::job::{Job, JobError, JobErrorType, JobFile, JobFileStatus, JobMetric, JobStatus};
use domain::sql_type::SqlColumnType;
use ingest::reader::{self, CsvLayout, RowEvent};
use ingest::{discovery, identifiers, inference};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use store::loader::BulkLoader;
use store::repository::JobRepository;
use store::schema::SchemaService;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_WORKER_PERMITS: usize = 4;
const SAMPLE_LIMIT: usize = 5_000;

///
/// Drives a bounded pool of file workers against a persisted Job/JobFile state machine (C8,
/// §4.8). Owns no mutable state itself beyond the worker permit count - every mutation goes
/// through the repository so the orchestrator can be rebuilt fresh per call.
pub struct Orchestrator {
    repository: Arc<dyn JobRepository>,
    schema: Arc<dyn SchemaService>,
    loader: Arc<dyn BulkLoader>,
    worker_permits: usize,
}

impl Orchestrator {
    pub fn new(repository: Arc<dyn JobRepository>, schema: Arc<dyn SchemaService>, loader: Arc<dyn BulkLoader>) -> Self {
        Self { repository, schema, loader, worker_permits: DEFAULT_WORKER_PERMITS }
    }

    pub fn with_worker_permits(mut self, permits: usize) -> Self {
        self.worker_permits = permits;
        self
    }

    ///
    /// Discovers every CSV file under `root_folder` and persists a new Job with one Pending
    /// JobFile per discovered file. Discovery failure (missing folder) is fatal before any Job
    /// exists, per §4.1.
    pub async fn create_job(&self, root_folder: String) -> Result<Uuid, OrchestratorError> {
        let files = discovery::discover_csv_files(Path::new(&root_folder))?;

        let mut job = Job::new(root_folder);
        job.total_files = files.len() as i32;
        self.repository.insert_job(&job).await?;

        for path in files {
            let file = JobFile::new_pending(job.id, path.to_string_lossy().to_string());
            self.repository.insert_job_file(&file).await?;
        }

        Ok(job.id)
    }

    ///
    /// A new Job over the same root folder as `orig_job_id`, rediscovering files from scratch.
    pub async fn create_reprocess_job(&self, orig_job_id: Uuid) -> Result<Uuid, OrchestratorError> {
        let orig = self.repository.get_job(orig_job_id).await?.ok_or(OrchestratorError::JobNotFound { id: orig_job_id })?;
        self.create_job(orig.root_folder).await
    }

    ///
    /// A new single-file Job cloned from one JobFile of an earlier run. The original destination
    /// table is dropped first so the reprocessed file starts from a clean table.
    pub async fn create_reprocess_file_job(&self, orig_job_id: Uuid, file_id: Uuid, connection_string: &str) -> Result<Uuid, OrchestratorError> {
        let orig_job = self.repository.get_job(orig_job_id).await?.ok_or(OrchestratorError::JobNotFound { id: orig_job_id })?;
        let orig_file = self.repository.get_job_file(file_id).await?.ok_or(OrchestratorError::JobFileNotFound { id: file_id })?;

        if let Some(table_name) = &orig_file.table_name {
            self.schema.drop_table(connection_string, table_name).await?;
        }

        let mut new_job = Job::new(orig_job.root_folder);
        new_job.total_files = 1;
        self.repository.insert_job(&new_job).await?;

        let new_file = JobFile::new_pending(new_job.id, orig_file.file_path);
        self.repository.insert_job_file(&new_file).await?;

        Ok(new_job.id)
    }

    ///
    /// Runs every Pending JobFile of `job_id` through the bounded worker pool and finalizes the
    /// Job's terminal state and end-of-job metrics. No rediscovery happens here - the reprocess
    /// special case of §4.8 falls out naturally because the JobFile set was already seeded by
    /// `create_job`/`create_reprocess_file_job`.
    pub async fn process(&self, job_id: Uuid, connection_string: &str, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        let mut job = self.repository.get_job(job_id).await?.ok_or(OrchestratorError::JobNotFound { id: job_id })?;
        log::info!("starting job {} for root folder {}", job.id, job.root_folder);
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.repository.update_job(&job).await?;

        let pending: Vec<JobFile> = self.repository.get_job_files(job_id).await?
            .into_iter()
            .filter(|f| f.status == JobFileStatus::Pending)
            .collect();

        if let Err(err) = self.run_files(job_id, pending, connection_string, cancel).await {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            self.repository.update_job(&job).await?;
            self.repository.insert_job_error(&JobError::new(job.id, None, JobErrorType::Other, err.to_string())).await?;
            return Err(err);
        }

        let files = self.repository.get_job_files(job_id).await?;
        job.processed_files = files.iter().filter(|f| matches!(f.status, JobFileStatus::Completed | JobFileStatus::Failed)).count() as i32;

        // A Job reaches Completed once every non-failed JobFile is Completed (§3 invariant) - a
        // StructuralFailure on one file doesn't fail the Job, only an orchestrator-level
        // exception does (§7). Files left non-terminal mean the run was cancelled mid-flight.
        job.status = if files.iter().all(|f| matches!(f.status, JobFileStatus::Completed | JobFileStatus::Failed)) {
            JobStatus::Completed
        } else {
            JobStatus::Cancelled
        };
        job.finished_at = Some(Utc::now());
        self.repository.update_job(&job).await?;

        log::info!("job {} finished with status {:?} ({} files processed)", job.id, job.status, files.len());
        self.record_end_of_job_metrics(&job, &files).await?;
        Ok(())
    }

    async fn run_files(&self, job_id: Uuid, pending: Vec<JobFile>, connection_string: &str, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(self.worker_permits.max(1)));
        let table_names: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::with_capacity(pending.len());

        for file in pending {
            if cancel.is_cancelled() {
                break;
            }

            let semaphore = semaphore.clone();
            let repository = self.repository.clone();
            let schema = self.schema.clone();
            let loader = self.loader.clone();
            let table_names = table_names.clone();
            let connection_string = connection_string.to_string();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                process_file(repository, schema, loader, connection_string, job_id, file, table_names, cancel).await
            }));
        }

        for handle in handles {
            handle.await.expect("file worker task panicked")?;
        }

        Ok(())
    }

    async fn record_end_of_job_metrics(&self, job: &Job, files: &[JobFile]) -> Result<(), OrchestratorError> {
        let total_read: i64 = files.iter().map(|f| f.lines_read).sum();
        let total_inserted: i64 = files.iter().map(|f| f.lines_inserted).sum();

        let utilization = if total_read == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(100) * Decimal::from(total_inserted) / Decimal::from(total_read)
        };
        self.repository.insert_job_metric(&JobMetric::new(job.id, "UtilizationPercentage", utilization)).await?;

        if let (Some(started), Some(finished)) = (job.started_at, job.finished_at) {
            let seconds = (finished - started).num_milliseconds() as f64 / 1000.0;
            let total_execution_time = Decimal::from_str(&format!("{:.3}", seconds)).unwrap_or(Decimal::ZERO);
            self.repository.insert_job_metric(&JobMetric::new(job.id, "TotalExecutionTime", total_execution_time)).await?;
        }

        Ok(())
    }
}

///
/// One file's lifecycle end-to-end (§4.8 "File processing sequence"), run as an independent
/// worker task under the job's semaphore permit.
#[allow(clippy::too_many_arguments)]
async fn process_file(
    repository: Arc<dyn JobRepository>,
    schema: Arc<dyn SchemaService>,
    loader: Arc<dyn BulkLoader>,
    connection_string: String,
    job_id: Uuid,
    mut file: JobFile,
    table_names: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
) -> Result<(), OrchestratorError> {
    log::debug!("processing file {} (job {})", file.file_path, job_id);
    file.status = JobFileStatus::Processing;
    file.started_at = Some(Utc::now());
    repository.update_job_file(&file).await?;

    let path = PathBuf::from(&file.file_path);

    let layout = match reader::analyse_layout(&path) {
        Ok(layout) => layout,
        Err(err) => return fail_structurally(&repository, job_id, file, err).await,
    };

    let column_types = match sample_column_types(&path, &layout, cancel.clone()) {
        Ok(types) => types,
        Err(err) => return fail_structurally(&repository, job_id, file, err).await,
    };

    let table_name = {
        let mut names = table_names.lock().await;
        let name = identifiers::sanitize_table_name(&path, &names);
        names.insert(name.clone());
        name
    };

    let mut accepted_columns: Vec<String> = Vec::with_capacity(layout.header.len());
    let column_names: Vec<String> = layout.header.iter()
        .map(|raw| {
            let name = identifiers::sanitize_column_name(raw, &accepted_columns);
            accepted_columns.push(name.clone());
            name
        })
        .collect();

    let columns: Vec<(String, SqlColumnType)> = column_names.iter().cloned().zip(column_types.iter().cloned()).collect();
    if let Err(err) = schema.create_table(&connection_string, &table_name, &columns).await {
        return fail_with_other(&repository, job_id, file, err.to_string()).await;
    }
    file.table_name = Some(table_name.clone());

    let stream = match reader::stream_rows(&path, &layout, cancel.clone()) {
        Ok(stream) => stream,
        Err(err) => return fail_structurally(&repository, job_id, file, err).await,
    };

    let mut rows: Vec<(u64, Vec<String>)> = Vec::new();
    let mut line_errors: u64 = 0;
    for event in stream {
        match event {
            RowEvent::Row { line_number, fields } => rows.push((line_number, fields)),
            RowEvent::Error { line_number, message } => {
                line_errors += 1;
                repository.insert_job_error(
                    &JobError::new(job_id, Some(file.id), JobErrorType::LineError, message).at_line(line_number as i64),
                ).await?;
            }
        }
    }
    file.lines_read = rows.len() as i64;

    let mut row_iter = rows.into_iter();
    let mut rejected: Vec<(u64, String)> = Vec::new();
    let inserted = {
        let mut on_row_error = |_row: Vec<String>, index: u64, reason: String| {
            rejected.push((index, reason));
        };
        loader.bulk_insert(&connection_string, &table_name, &column_names, &column_types, &mut row_iter, &mut on_row_error, &cancel).await?
    };

    for (line_number, reason) in &rejected {
        repository.insert_job_error(
            &JobError::new(job_id, Some(file.id), JobErrorType::DatabaseError, reason.clone()).at_line(*line_number as i64),
        ).await?;
    }

    file.lines_inserted = inserted as i64;
    file.lines_rejected = line_errors as i64 + rejected.len() as i64;
    file.finished_at = Some(Utc::now());

    // Cancellation can land after the streaming loop above has already ended (it checks
    // cancel.is_cancelled() on every read) or mid-way through bulk_insert's own row loop - either
    // way the file only has a partial load, so it must not be reported as Completed.
    if cancel.is_cancelled() {
        log::warn!("file {} cancelled mid-stream (job {}): {} read, {} inserted, {} rejected", file.file_path, job_id, file.lines_read, file.lines_inserted, file.lines_rejected);
        repository.insert_job_error(
            &JobError::new(job_id, Some(file.id), JobErrorType::Other, "processing cancelled before the file finished loading".to_string()),
        ).await?;
        file.status = JobFileStatus::Failed;
        repository.update_job_file(&file).await?;
        return Ok(());
    }

    file.status = JobFileStatus::Completed;
    repository.update_job_file(&file).await?;
    log::info!("file {} loaded (job {}): {} read, {} inserted, {} rejected", file.file_path, job_id, file.lines_read, file.lines_inserted, file.lines_rejected);

    let elapsed = (file.finished_at.unwrap() - file.started_at.unwrap()).num_milliseconds() as f64 / 1000.0;
    let basename = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| table_name.clone());
    let metric_value = Decimal::from_str(&format!("{:.3}", elapsed)).unwrap_or(Decimal::ZERO);
    repository.insert_job_metric(&JobMetric::new(job_id, format!("FileProcessingTime_{}", basename), metric_value)).await?;

    Ok(())
}

///
/// Samples up to 5,000 raw values per column (a second read pass, §9) and infers one
/// `SqlColumnType` per column.
fn sample_column_types(path: &Path, layout: &CsvLayout, cancel: CancellationToken) -> Result<Vec<SqlColumnType>, ingest::IngestError> {
    let mut samples: Vec<Vec<String>> = vec![Vec::new(); layout.header.len()];
    let stream = reader::stream_rows(path, layout, cancel)?;

    for event in stream {
        if let RowEvent::Row { fields, .. } = event {
            for (column, value) in samples.iter_mut().zip(fields) {
                if column.len() < SAMPLE_LIMIT {
                    column.push(value);
                }
            }
        }
        if samples.iter().all(|s| s.len() >= SAMPLE_LIMIT) {
            break;
        }
    }

    Ok(samples.into_iter().map(|values| inference::infer_column_type(values.into_iter())).collect())
}

async fn fail_structurally(repository: &Arc<dyn JobRepository>, job_id: Uuid, mut file: JobFile, err: ingest::IngestError) -> Result<(), OrchestratorError> {
    log::warn!("file {} failed structurally (job {}): {}", file.file_path, job_id, err);
    let error_type = if err.is_structural() { JobErrorType::StructuralFailure } else { JobErrorType::Other };
    repository.insert_job_error(&JobError::new(job_id, Some(file.id), error_type, err.to_string())).await?;

    file.status = JobFileStatus::Failed;
    file.finished_at = Some(Utc::now());
    repository.update_job_file(&file).await?;
    Ok(())
}

async fn fail_with_other(repository: &Arc<dyn JobRepository>, job_id: Uuid, mut file: JobFile, message: String) -> Result<(), OrchestratorError> {
    log::error!("file {} failed (job {}): {}", file.file_path, job_id, message);
    repository.insert_job_error(&JobError::new(job_id, Some(file.id), JobErrorType::Other, message)).await?;

    file.status = JobFileStatus::Failed;
    file.finished_at = Some(Utc::now());
    repository.update_job_file(&file).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoopBulkLoader, NoopSchema};
    use domain::job::JobErrorType;
    use store::repository::InMemoryJobRepository;

    fn orchestrator(repository: Arc<InMemoryJobRepository>, schema: Arc<NoopSchema>, loader: Arc<NoopBulkLoader>) -> Orchestrator {
        Orchestrator::new(repository, schema, loader)
    }

    // §8 scenario 1: two well-formed files, one bad value each, no LineErrors, NULLs on the bad cells.
    #[tokio::test]
    async fn test_two_files_infer_types_and_null_out_bad_cells() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sales.csv"), "id;amount;date\n1;10.50;2024-01-02\n2;x;2024/02/03\n").unwrap();
        std::fs::write(dir.path().join("users.csv"), "name,age\nAlice,30\nBob,\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orch = orchestrator(repository.clone(), schema.clone(), loader.clone());

        let job_id = orch.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();
        orch.process(job_id, "unused", CancellationToken::new()).await.unwrap();

        let job = repository.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(JobStatus::Completed, job.status);

        let files = repository.get_job_files(job_id).await.unwrap();
        assert!(files.iter().all(|f| f.status == JobFileStatus::Completed));

        let errors = repository.get_job_errors(job_id).await.unwrap();
        assert!(errors.iter().all(|e| e.error_type != JobErrorType::LineError));

        let created = schema.created.lock().unwrap();
        let sales_columns = created.get("TB_sales").expect("TB_sales created");
        assert_eq!("id", sales_columns[0].0);
        // "10.50" has 2 integer digits and 2 fractional digits, so precision = 2 + 2 = 4.
        assert_eq!(SqlColumnType::Decimal { precision: 4, scale: 2, reliable: true }, sales_columns[1].1);
        assert!(matches!(sales_columns[2].1, SqlColumnType::Date { .. }));

        let users_columns = created.get("TB_users").expect("TB_users created");
        assert!(matches!(users_columns[0].1, SqlColumnType::NVarChar { .. }));
        assert!(matches!(users_columns[1].1, SqlColumnType::Int { .. }));
        drop(created);

        let tables = loader.tables.lock().unwrap();
        let sales_rows = tables.get("TB_sales").unwrap();
        assert_eq!(2, sales_rows.len());
        assert_eq!(None, sales_rows[1][1]); // "x" is not a valid decimal -> NULL.

        let user_rows = tables.get("TB_users").unwrap();
        assert_eq!(2, user_rows.len());
        assert_eq!(None, user_rows[1][1]); // empty age -> NULL.
    }

    // §8 scenario 2: a name collision between sibling files resolves with the "NN_" prefix.
    #[tokio::test]
    async fn test_name_collision_between_directories_gets_numbered_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sales.csv"), "a,b\n1,2\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/sales.csv"), "c,d,e\n1,2,3\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orch = orchestrator(repository.clone(), schema.clone(), loader);

        let job_id = orch.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();
        orch.process(job_id, "unused", CancellationToken::new()).await.unwrap();

        let job = repository.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(JobStatus::Completed, job.status);

        let files = repository.get_job_files(job_id).await.unwrap();
        assert!(files.iter().all(|f| f.status == JobFileStatus::Completed));

        let mut names: Vec<String> = files.iter().map(|f| f.table_name.clone().unwrap()).collect();
        names.sort();
        assert_eq!(vec!["01_TB_sales".to_string(), "TB_sales".to_string()], names);
    }

    // §8 scenario 3: a column-count mismatch is counted as rejected and reported at the right line.
    #[tokio::test]
    async fn test_column_mismatch_counts_as_rejected_not_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.csv"), "a;b\nonly-one-field\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orch = orchestrator(repository.clone(), schema, loader);

        let job_id = orch.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();
        orch.process(job_id, "unused", CancellationToken::new()).await.unwrap();

        let files = repository.get_job_files(job_id).await.unwrap();
        assert_eq!(1, files.len());
        let file = &files[0];
        assert_eq!(JobFileStatus::Completed, file.status);
        assert_eq!(0, file.lines_read);
        assert_eq!(1, file.lines_rejected);

        let errors = repository.get_job_errors(job_id).await.unwrap();
        assert_eq!(1, errors.len());
        assert_eq!(JobErrorType::LineError, errors[0].error_type);
        assert_eq!(Some(2), errors[0].line_number);
    }

    // A database-rejected row further down a file (past earlier LineErrors) is reported at its
    // real file line, not its ordinal position among the rows that parsed successfully.
    #[tokio::test]
    async fn test_database_rejected_row_reports_its_real_file_line() {
        use crate::test_support::RejectingBulkLoader;

        let dir = tempfile::tempdir().unwrap();
        // Line 2 is a LineError (dropped before reaching the loader); line 4 ("bad") is the row
        // the loader rejects. If the loader saw ordinal positions instead of real line numbers,
        // "bad" would be misreported as line 3 (its position among the two rows the loader sees).
        std::fs::write(dir.path().join("f.csv"), "a,b\nonly-one-field\nbad,2\nok,3\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(RejectingBulkLoader { reject_value: "bad".to_string() });
        let orch = orchestrator_with_loader(repository.clone(), schema, loader);

        let job_id = orch.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();
        orch.process(job_id, "unused", CancellationToken::new()).await.unwrap();

        let errors = repository.get_job_errors(job_id).await.unwrap();
        let db_error = errors.iter().find(|e| e.error_type == JobErrorType::DatabaseError).expect("a DatabaseError was recorded");
        assert_eq!(Some(3), db_error.line_number);
    }

    fn orchestrator_with_loader(
        repository: Arc<InMemoryJobRepository>,
        schema: Arc<NoopSchema>,
        loader: Arc<crate::test_support::RejectingBulkLoader>,
    ) -> Orchestrator {
        Orchestrator::new(repository, schema, loader)
    }

    // §8 scenario 4: a missing file fails structurally but siblings still complete the job.
    #[tokio::test]
    async fn test_missing_file_fails_structurally_job_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.csv"), "a,b\n1,2\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orch = orchestrator(repository.clone(), schema, loader);

        let mut job = Job::new(dir.path().to_string_lossy().to_string());
        job.total_files = 2;
        repository.insert_job(&job).await.unwrap();
        repository.insert_job_file(&JobFile::new_pending(job.id, dir.path().join("present.csv").to_string_lossy().to_string())).await.unwrap();
        repository.insert_job_file(&JobFile::new_pending(job.id, dir.path().join("missing.csv").to_string_lossy().to_string())).await.unwrap();

        orch.process(job.id, "unused", CancellationToken::new()).await.unwrap();

        let updated_job = repository.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(JobStatus::Completed, updated_job.status);

        let files = repository.get_job_files(job.id).await.unwrap();
        let present = files.iter().find(|f| f.file_path.ends_with("present.csv")).unwrap();
        let missing = files.iter().find(|f| f.file_path.ends_with("missing.csv")).unwrap();
        assert_eq!(JobFileStatus::Completed, present.status);
        assert_eq!(JobFileStatus::Failed, missing.status);

        let errors = repository.get_job_errors(job.id).await.unwrap();
        assert!(errors.iter().any(|e| e.job_file_id == Some(missing.id) && e.error_type == JobErrorType::StructuralFailure));
    }

    // §8 scenario 5: reprocessing a single file drops its old table and runs a fresh load.
    #[tokio::test]
    async fn test_reprocess_file_drops_and_recreates_destination_table() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sales.csv"), "id,amount\n1,10\n2,20\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orch = orchestrator(repository.clone(), schema.clone(), loader.clone());

        let job_id = orch.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();
        orch.process(job_id, "unused", CancellationToken::new()).await.unwrap();

        let original_file = repository.get_job_files(job_id).await.unwrap().into_iter().next().unwrap();
        assert_eq!(JobFileStatus::Completed, original_file.status);

        let reprocess_job_id = orch.create_reprocess_file_job(job_id, original_file.id, "unused").await.unwrap();
        assert!(schema.dropped.lock().unwrap().contains("TB_sales"));

        orch.process(reprocess_job_id, "unused", CancellationToken::new()).await.unwrap();

        let reprocess_job = repository.get_job(reprocess_job_id).await.unwrap().unwrap();
        assert_eq!(JobStatus::Completed, reprocess_job.status);
        assert_eq!(1, reprocess_job.total_files);

        let reprocessed_files = repository.get_job_files(reprocess_job_id).await.unwrap();
        assert_eq!(1, reprocessed_files.len());
        assert_eq!(2, reprocessed_files[0].lines_read);
        assert_eq!(2, reprocessed_files[0].lines_inserted);
        assert!(schema.created.lock().unwrap().contains_key("TB_sales"));
    }

    // §8 boundary behaviour: cancelling mid-stream must not leave the JobFile Completed, even
    // though the reader and loader both unwind cleanly rather than erroring. Drives process_file
    // directly (rather than through process()/run_files) with an already-cancelled token so the
    // cancellation is observed inside the streaming/loading section itself, not before the file
    // is even picked up.
    #[tokio::test]
    async fn test_cancel_mid_stream_fails_the_file_not_completes_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sales.csv"), "a,b\n1,2\n3,4\n").unwrap();

        let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::default());
        let schema: Arc<dyn SchemaService> = Arc::new(NoopSchema::default());
        let loader: Arc<dyn BulkLoader> = Arc::new(NoopBulkLoader::default());

        let mut job = Job::new(dir.path().to_string_lossy().to_string());
        job.total_files = 1;
        repository.insert_job(&job).await.unwrap();
        let file = JobFile::new_pending(job.id, dir.path().join("sales.csv").to_string_lossy().to_string());
        repository.insert_job_file(&file).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        process_file(repository.clone(), schema, loader, "unused".to_string(), job.id, file.clone(), Arc::new(Mutex::new(HashSet::new())), cancel)
            .await
            .unwrap();

        let updated = repository.get_job_file(file.id).await.unwrap().unwrap();
        assert_ne!(JobFileStatus::Completed, updated.status);
        assert_eq!(JobFileStatus::Failed, updated.status);

        let errors = repository.get_job_errors(job.id).await.unwrap();
        assert!(errors.iter().any(|e| e.job_file_id == Some(file.id)));
    }

    // §8: a Completed JobFile's FileProcessingTime_<name> metric is recorded exactly once.
    #[tokio::test]
    async fn test_completed_file_records_exactly_one_processing_time_metric() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sales.csv"), "a,b\n1,2\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orch = orchestrator(repository.clone(), schema, loader);

        let job_id = orch.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();
        orch.process(job_id, "unused", CancellationToken::new()).await.unwrap();

        let metrics = repository.get_job_metrics(job_id).await.unwrap();
        let processing_time_metrics: Vec<_> = metrics.iter().filter(|m| m.metric_name.starts_with("FileProcessingTime_")).collect();
        assert_eq!(1, processing_time_metrics.len());
        assert!(metrics.iter().any(|m| m.metric_name == "UtilizationPercentage"));
        assert!(metrics.iter().any(|m| m.metric_name == "TotalExecutionTime"));
    }
}
