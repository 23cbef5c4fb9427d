use crate::connection::connect;
use crate::error::StoreError;
use async_trait::async_trait;
use domain::job::{Job, JobError, JobErrorType, JobFile, JobFileStatus, JobMetric, JobStatus};
use std::collections::HashMap;
use std::sync::Mutex;
use tiberius::Row;
use uuid::Uuid;

///
/// CRUD for the four control-plane entities (C7, §4.7), plus one-time schema initialization.
/// Implemented against a live SQL Server (`SqlJobRepository`) and in-memory (`InMemoryJobRepository`)
/// so the orchestrator's state machine can be exercised without a database (§9 test tooling).
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn initialize_schema(&self) -> Result<(), StoreError>;

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;
    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn insert_job_file(&self, file: &JobFile) -> Result<(), StoreError>;
    async fn update_job_file(&self, file: &JobFile) -> Result<(), StoreError>;
    async fn get_job_file(&self, id: Uuid) -> Result<Option<JobFile>, StoreError>;
    async fn get_job_files(&self, job_id: Uuid) -> Result<Vec<JobFile>, StoreError>;

    async fn insert_job_error(&self, error: &JobError) -> Result<(), StoreError>;
    async fn get_job_errors(&self, job_id: Uuid) -> Result<Vec<JobError>, StoreError>;

    async fn insert_job_metric(&self, metric: &JobMetric) -> Result<(), StoreError>;
    async fn get_job_metrics(&self, job_id: Uuid) -> Result<Vec<JobMetric>, StoreError>;
}

pub struct SqlJobRepository {
    pub connection_string: String,
}

const CREATE_TABLES_SQL: &str = r#"
IF NOT EXISTS (SELECT * FROM sys.objects WHERE object_id = OBJECT_ID(N'[dbo].[Jobs]') AND type IN (N'U'))
CREATE TABLE [dbo].[Jobs] (
    [Id] uniqueidentifier NOT NULL PRIMARY KEY,
    [CreatedAt] datetime2 NOT NULL,
    [StartedAt] datetime2 NULL,
    [FinishedAt] datetime2 NULL,
    [Status] int NOT NULL,
    [RootFolder] nvarchar(4000) NOT NULL,
    [TotalFiles] int NOT NULL,
    [ProcessedFiles] int NOT NULL
);
IF NOT EXISTS (SELECT * FROM sys.objects WHERE object_id = OBJECT_ID(N'[dbo].[JobFiles]') AND type IN (N'U'))
CREATE TABLE [dbo].[JobFiles] (
    [Id] uniqueidentifier NOT NULL PRIMARY KEY,
    [JobId] uniqueidentifier NOT NULL FOREIGN KEY REFERENCES [dbo].[Jobs]([Id]),
    [FilePath] nvarchar(4000) NOT NULL,
    [Status] int NOT NULL,
    [StartedAt] datetime2 NULL,
    [FinishedAt] datetime2 NULL,
    [LinesRead] bigint NOT NULL,
    [LinesInserted] bigint NOT NULL,
    [LinesRejected] bigint NOT NULL,
    [TableName] nvarchar(128) NULL
);
IF NOT EXISTS (SELECT * FROM sys.objects WHERE object_id = OBJECT_ID(N'[dbo].[JobErrors]') AND type IN (N'U'))
CREATE TABLE [dbo].[JobErrors] (
    [Id] uniqueidentifier NOT NULL PRIMARY KEY,
    [JobId] uniqueidentifier NOT NULL FOREIGN KEY REFERENCES [dbo].[Jobs]([Id]),
    [JobFileId] uniqueidentifier NULL FOREIGN KEY REFERENCES [dbo].[JobFiles]([Id]),
    [LineNumber] bigint NULL,
    [ColumnName] nvarchar(128) NULL,
    [ErrorType] int NOT NULL,
    [Message] nvarchar(4000) NOT NULL,
    [CreatedAt] datetime2 NOT NULL
);
IF NOT EXISTS (SELECT * FROM sys.objects WHERE object_id = OBJECT_ID(N'[dbo].[JobMetrics]') AND type IN (N'U'))
CREATE TABLE [dbo].[JobMetrics] (
    [Id] uniqueidentifier NOT NULL PRIMARY KEY,
    [JobId] uniqueidentifier NOT NULL FOREIGN KEY REFERENCES [dbo].[Jobs]([Id]),
    [MetricName] nvarchar(256) NOT NULL,
    [MetricValue] decimal(28,8) NOT NULL,
    [RecordedAt] datetime2 NOT NULL
);
"#;

#[async_trait]
impl JobRepository for SqlJobRepository {
    async fn initialize_schema(&self) -> Result<(), StoreError> {
        log::info!("initializing control-plane schema");
        let mut client = connect(&self.connection_string).await?;
        for statement in CREATE_TABLES_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            client.execute(statement, &[]).await.map_err(|source| StoreError::Repository { source })?;
        }
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut client = connect(&self.connection_string).await?;
        client
            .execute(
                "INSERT INTO [dbo].[Jobs] (Id, CreatedAt, StartedAt, FinishedAt, Status, RootFolder, TotalFiles, ProcessedFiles) \
                 VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8)",
                &[&job.id, &job.created_at.naive_utc(), &job.started_at.map(|t| t.naive_utc()), &job.finished_at.map(|t| t.naive_utc()),
                  &(job.status as i32), &job.root_folder, &job.total_files, &job.processed_files],
            )
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        log::debug!("job {} transitioning to {:?}", job.id, job.status);
        let mut client = connect(&self.connection_string).await?;
        client
            .execute(
                "UPDATE [dbo].[Jobs] SET StartedAt=@P2, FinishedAt=@P3, Status=@P4, TotalFiles=@P5, ProcessedFiles=@P6 WHERE Id=@P1",
                &[&job.id, &job.started_at.map(|t| t.naive_utc()), &job.finished_at.map(|t| t.naive_utc()),
                  &(job.status as i32), &job.total_files, &job.processed_files],
            )
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut client = connect(&self.connection_string).await?;
        let row = client
            .query("SELECT Id, CreatedAt, StartedAt, FinishedAt, Status, RootFolder, TotalFiles, ProcessedFiles FROM [dbo].[Jobs] WHERE Id=@P1", &[&id])
            .await
            .map_err(|source| StoreError::Repository { source })?
            .into_row()
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(row.as_ref().map(row_to_job))
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut client = connect(&self.connection_string).await?;
        let rows = client
            .query("SELECT Id, CreatedAt, StartedAt, FinishedAt, Status, RootFolder, TotalFiles, ProcessedFiles FROM [dbo].[Jobs] ORDER BY CreatedAt DESC", &[])
            .await
            .map_err(|source| StoreError::Repository { source })?
            .into_first_result()
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn insert_job_file(&self, file: &JobFile) -> Result<(), StoreError> {
        let mut client = connect(&self.connection_string).await?;
        client
            .execute(
                "INSERT INTO [dbo].[JobFiles] (Id, JobId, FilePath, Status, StartedAt, FinishedAt, LinesRead, LinesInserted, LinesRejected, TableName) \
                 VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8, @P9, @P10)",
                &[&file.id, &file.job_id, &file.file_path, &(file.status as i32), &file.started_at.map(|t| t.naive_utc()),
                  &file.finished_at.map(|t| t.naive_utc()), &file.lines_read, &file.lines_inserted, &file.lines_rejected, &file.table_name],
            )
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(())
    }

    async fn update_job_file(&self, file: &JobFile) -> Result<(), StoreError> {
        log::debug!("file {} ({}) transitioning to {:?}", file.id, file.file_path, file.status);
        let mut client = connect(&self.connection_string).await?;
        client
            .execute(
                "UPDATE [dbo].[JobFiles] SET Status=@P2, StartedAt=@P3, FinishedAt=@P4, LinesRead=@P5, LinesInserted=@P6, LinesRejected=@P7, TableName=@P8 WHERE Id=@P1",
                &[&file.id, &(file.status as i32), &file.started_at.map(|t| t.naive_utc()), &file.finished_at.map(|t| t.naive_utc()),
                  &file.lines_read, &file.lines_inserted, &file.lines_rejected, &file.table_name],
            )
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(())
    }

    async fn get_job_file(&self, id: Uuid) -> Result<Option<JobFile>, StoreError> {
        let mut client = connect(&self.connection_string).await?;
        let row = client
            .query("SELECT Id, JobId, FilePath, Status, StartedAt, FinishedAt, LinesRead, LinesInserted, LinesRejected, TableName FROM [dbo].[JobFiles] WHERE Id=@P1", &[&id])
            .await
            .map_err(|source| StoreError::Repository { source })?
            .into_row()
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(row.as_ref().map(row_to_job_file))
    }

    async fn get_job_files(&self, job_id: Uuid) -> Result<Vec<JobFile>, StoreError> {
        let mut client = connect(&self.connection_string).await?;
        let rows = client
            .query("SELECT Id, JobId, FilePath, Status, StartedAt, FinishedAt, LinesRead, LinesInserted, LinesRejected, TableName FROM [dbo].[JobFiles] WHERE JobId=@P1", &[&job_id])
            .await
            .map_err(|source| StoreError::Repository { source })?
            .into_first_result()
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(rows.iter().map(row_to_job_file).collect())
    }

    async fn insert_job_error(&self, error: &JobError) -> Result<(), StoreError> {
        let mut client = connect(&self.connection_string).await?;
        client
            .execute(
                "INSERT INTO [dbo].[JobErrors] (Id, JobId, JobFileId, LineNumber, ColumnName, ErrorType, Message, CreatedAt) \
                 VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8)",
                &[&error.id, &error.job_id, &error.job_file_id, &error.line_number, &error.column_name,
                  &(error.error_type as i32), &error.message, &error.created_at.naive_utc()],
            )
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(())
    }

    async fn get_job_errors(&self, job_id: Uuid) -> Result<Vec<JobError>, StoreError> {
        let mut client = connect(&self.connection_string).await?;
        let rows = client
            .query("SELECT Id, JobId, JobFileId, LineNumber, ColumnName, ErrorType, Message, CreatedAt FROM [dbo].[JobErrors] WHERE JobId=@P1", &[&job_id])
            .await
            .map_err(|source| StoreError::Repository { source })?
            .into_first_result()
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(rows.iter().map(row_to_job_error).collect())
    }

    async fn insert_job_metric(&self, metric: &JobMetric) -> Result<(), StoreError> {
        let mut client = connect(&self.connection_string).await?;
        client
            .execute(
                "INSERT INTO [dbo].[JobMetrics] (Id, JobId, MetricName, MetricValue, RecordedAt) VALUES (@P1, @P2, @P3, @P4, @P5)",
                &[&metric.id, &metric.job_id, &metric.metric_name, &metric.metric_value, &metric.recorded_at.naive_utc()],
            )
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(())
    }

    async fn get_job_metrics(&self, job_id: Uuid) -> Result<Vec<JobMetric>, StoreError> {
        let mut client = connect(&self.connection_string).await?;
        let rows = client
            .query("SELECT Id, JobId, MetricName, MetricValue, RecordedAt FROM [dbo].[JobMetrics] WHERE JobId=@P1", &[&job_id])
            .await
            .map_err(|source| StoreError::Repository { source })?
            .into_first_result()
            .await
            .map_err(|source| StoreError::Repository { source })?;
        Ok(rows.iter().map(row_to_job_metric).collect())
    }
}

fn row_to_job(row: &Row) -> Job {
    Job {
        id: row.get(0).unwrap(),
        created_at: chrono::DateTime::from_naive_utc_and_offset(row.get(1).unwrap(), chrono::Utc),
        started_at: row.get::<chrono::NaiveDateTime, _>(2).map(|t| chrono::DateTime::from_naive_utc_and_offset(t, chrono::Utc)),
        finished_at: row.get::<chrono::NaiveDateTime, _>(3).map(|t| chrono::DateTime::from_naive_utc_and_offset(t, chrono::Utc)),
        status: JobStatus::from_ordinal(row.get(4).unwrap()).expect("unknown JobStatus ordinal in database"),
        root_folder: row.get::<&str, _>(5).unwrap().to_string(),
        total_files: row.get(6).unwrap(),
        processed_files: row.get(7).unwrap(),
    }
}

fn row_to_job_file(row: &Row) -> JobFile {
    JobFile {
        id: row.get(0).unwrap(),
        job_id: row.get(1).unwrap(),
        file_path: row.get::<&str, _>(2).unwrap().to_string(),
        status: JobFileStatus::from_ordinal(row.get(3).unwrap()).expect("unknown JobFileStatus ordinal in database"),
        started_at: row.get::<chrono::NaiveDateTime, _>(4).map(|t| chrono::DateTime::from_naive_utc_and_offset(t, chrono::Utc)),
        finished_at: row.get::<chrono::NaiveDateTime, _>(5).map(|t| chrono::DateTime::from_naive_utc_and_offset(t, chrono::Utc)),
        lines_read: row.get(6).unwrap(),
        lines_inserted: row.get(7).unwrap(),
        lines_rejected: row.get(8).unwrap(),
        table_name: row.get::<&str, _>(9).map(|s| s.to_string()),
    }
}

fn row_to_job_error(row: &Row) -> JobError {
    JobError {
        id: row.get(0).unwrap(),
        job_id: row.get(1).unwrap(),
        job_file_id: row.get(2),
        line_number: row.get(3),
        column_name: row.get::<&str, _>(4).map(|s| s.to_string()),
        error_type: JobErrorType::from_ordinal(row.get(5).unwrap()).expect("unknown JobErrorType ordinal in database"),
        message: row.get::<&str, _>(6).unwrap().to_string(),
        created_at: chrono::DateTime::from_naive_utc_and_offset(row.get(7).unwrap(), chrono::Utc),
    }
}

fn row_to_job_metric(row: &Row) -> JobMetric {
    JobMetric {
        id: row.get(0).unwrap(),
        job_id: row.get(1).unwrap(),
        metric_name: row.get::<&str, _>(2).unwrap().to_string(),
        metric_value: row.get(3).unwrap(),
        recorded_at: chrono::DateTime::from_naive_utc_and_offset(row.get(4).unwrap(), chrono::Utc),
    }
}

///
/// In-memory stand-in used by orchestrator tests (§9) - no network, no SQL Server required.
/// Guarded by a single `std::sync::Mutex` since test workloads are small and single-process.
#[derive(Default)]
pub struct InMemoryJobRepository {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    files: HashMap<Uuid, JobFile>,
    errors: Vec<JobError>,
    metrics: Vec<JobMetric>,
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn initialize_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.lock().unwrap().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.lock().unwrap().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.inner.lock().unwrap().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        Ok(jobs)
    }

    async fn insert_job_file(&self, file: &JobFile) -> Result<(), StoreError> {
        self.inner.lock().unwrap().files.insert(file.id, file.clone());
        Ok(())
    }

    async fn update_job_file(&self, file: &JobFile) -> Result<(), StoreError> {
        self.inner.lock().unwrap().files.insert(file.id, file.clone());
        Ok(())
    }

    async fn get_job_file(&self, id: Uuid) -> Result<Option<JobFile>, StoreError> {
        Ok(self.inner.lock().unwrap().files.get(&id).cloned())
    }

    async fn get_job_files(&self, job_id: Uuid) -> Result<Vec<JobFile>, StoreError> {
        Ok(self.inner.lock().unwrap().files.values().filter(|f| f.job_id == job_id).cloned().collect())
    }

    async fn insert_job_error(&self, error: &JobError) -> Result<(), StoreError> {
        self.inner.lock().unwrap().errors.push(error.clone());
        Ok(())
    }

    async fn get_job_errors(&self, job_id: Uuid) -> Result<Vec<JobError>, StoreError> {
        Ok(self.inner.lock().unwrap().errors.iter().filter(|e| e.job_id == job_id).cloned().collect())
    }

    async fn insert_job_metric(&self, metric: &JobMetric) -> Result<(), StoreError> {
        self.inner.lock().unwrap().metrics.push(metric.clone());
        Ok(())
    }

    async fn get_job_metrics(&self, job_id: Uuid) -> Result<Vec<JobMetric>, StoreError> {
        Ok(self.inner.lock().unwrap().metrics.iter().filter(|m| m.job_id == job_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::job::Job;

    #[tokio::test]
    async fn test_in_memory_repository_round_trips_a_job() {
        let repo = InMemoryJobRepository::default();
        let job = Job::new("/data/inbox".to_string());
        repo.insert_job(&job).await.unwrap();

        let fetched = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.root_folder, fetched.root_folder);
        assert_eq!(JobStatus::Created, fetched.status);
    }

    #[tokio::test]
    async fn test_in_memory_repository_lists_newest_job_first() {
        let repo = InMemoryJobRepository::default();
        let older = Job::new("/a".to_string());
        let mut newer = Job::new("/b".to_string());
        newer.created_at = older.created_at + chrono::Duration::seconds(5);

        repo.insert_job(&older).await.unwrap();
        repo.insert_job(&newer).await.unwrap();

        let jobs = repo.get_all_jobs().await.unwrap();
        assert_eq!(newer.id, jobs[0].id);
    }

    #[tokio::test]
    async fn test_in_memory_repository_scopes_errors_to_job() {
        let repo = InMemoryJobRepository::default();
        let job_a = Job::new("/a".to_string());
        let job_b = Job::new("/b".to_string());
        repo.insert_job(&job_a).await.unwrap();
        repo.insert_job(&job_b).await.unwrap();

        repo.insert_job_error(&JobError::new(job_a.id, None, JobErrorType::Other, "boom")).await.unwrap();
        repo.insert_job_error(&JobError::new(job_b.id, None, JobErrorType::Other, "bang")).await.unwrap();

        let errors_a = repo.get_job_errors(job_a.id).await.unwrap();
        assert_eq!(1, errors_a.len());
        assert_eq!("boom", errors_a[0].message);
    }
}
