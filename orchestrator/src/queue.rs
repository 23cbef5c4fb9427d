use crate::job::Orchestrator;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

///
/// A single background consumer holding a FIFO of `(jobId, connectionString)` tuples (C9, §4.9).
/// Submission is non-blocking; the consumer dispatches each item to a fresh orchestrator task so
/// multiple jobs can run concurrently - the queue imposes no cross-job serialization, only each
/// job's own worker-pool semaphore does.
pub struct JobQueue {
    sender: mpsc::UnboundedSender<(Uuid, String)>,
    shutdown: CancellationToken,
}

impl JobQueue {
    ///
    /// Spawns the consumer task against `orchestrator` and returns the queue handle plus the
    /// consumer's `JoinHandle` (awaited on drain/shutdown by the caller, e.g. the CLI binary).
    pub fn start(orchestrator: Arc<Orchestrator>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn(run_consumer(orchestrator, receiver, shutdown.clone()));
        (Self { sender, shutdown }, consumer)
    }

    ///
    /// Enqueue a job for processing. Never blocks; returns once the tuple is queued.
    pub fn submit(&self, job_id: Uuid, connection_string: String) {
        if self.sender.send((job_id, connection_string)).is_err() {
            log::warn!("job queue consumer has already shut down; job {} was not enqueued", job_id);
        }
    }

    ///
    /// Signals the consumer to stop pulling new work. Jobs already handed to a worker keep
    /// running under their own independent cancellation context to completion - this only stops
    /// the queue from picking up anything further, it does not abort in-flight work (§5 graceful
    /// shutdown).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_consumer(orchestrator: Arc<Orchestrator>, mut receiver: mpsc::UnboundedReceiver<(Uuid, String)>, shutdown: CancellationToken) {
    let mut dispatched: JoinSet<()> = JoinSet::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            item = receiver.recv() => item,
        };

        let Some((job_id, connection_string)) = next else {
            // Shutdown won the race against recv(): drain whatever was already queued before
            // this tick so a job submitted just ahead of shutdown() is still dispatched rather
            // than silently dropped with the receiver.
            while let Ok((job_id, connection_string)) = receiver.try_recv() {
                dispatch(&orchestrator, job_id, connection_string, &mut dispatched);
            }
            log::info!("job queue consumer shutting down");
            break;
        };

        dispatch(&orchestrator, job_id, connection_string, &mut dispatched);
    }

    // Drain every in-flight dispatch before this task exits, so a caller awaiting the consumer's
    // JoinHandle (e.g. Migrator::shutdown) only sees quiescence once all jobs have actually
    // finished running - not merely been asked to stop.
    while dispatched.join_next().await.is_some() {}
}

fn dispatch(orchestrator: &Arc<Orchestrator>, job_id: Uuid, connection_string: String, dispatched: &mut JoinSet<()>) {
    let orchestrator = orchestrator.clone();
    // Each dispatched job gets its own cancellation context, independent of the queue's shutdown
    // signal - shutting down the queue stops new work from being picked up, it must not reach
    // back and cancel a job that is already running or was just handed off.
    let cancel = CancellationToken::new();
    dispatched.spawn(async move {
        log::info!("job queue dispatching job {}", job_id);
        if let Err(err) = orchestrator.process(job_id, &connection_string, cancel).await {
            log::error!("job {} failed: {}", job_id, err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Orchestrator;
    use crate::test_support::{NoopBulkLoader, NoopSchema};
    use std::time::Duration;
    use store::repository::{InMemoryJobRepository, JobRepository};

    #[tokio::test]
    async fn test_submitted_job_is_picked_up_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "x,y\n1,2\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orchestrator = Arc::new(Orchestrator::new(repository.clone(), schema, loader));

        let job_id = orchestrator.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();

        let (queue, _consumer) = JobQueue::start(orchestrator);
        queue.submit(job_id, "irrelevant".to_string());

        for _ in 0..200 {
            if let Some(job) = repository.get_job(job_id).await.unwrap() {
                if job.status != domain::job::JobStatus::Created && job.status != domain::job::JobStatus::Running {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    // Awaiting shutdown's JoinHandle must not return until every already-dispatched job has
    // actually stopped running, not merely been told to.
    #[tokio::test]
    async fn test_shutdown_drains_in_flight_dispatch_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "x,y\n1,2\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orchestrator = Arc::new(Orchestrator::new(repository.clone(), schema, loader));

        let job_id = orchestrator.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();

        let (queue, consumer) = JobQueue::start(orchestrator);
        queue.submit(job_id, "irrelevant".to_string());
        queue.shutdown(); // shuts down immediately, racing the consumer's first recv().
        consumer.await.unwrap();

        let job = repository.get_job(job_id).await.unwrap().unwrap();
        assert_ne!(domain::job::JobStatus::Running, job.status);
        assert_ne!(domain::job::JobStatus::Created, job.status);
    }

    // Shutting down the queue right after submit must not cancel the job itself - it only stops
    // the queue from picking up further work. The already-dispatched job runs its own independent
    // cancellation context to completion.
    #[tokio::test]
    async fn test_shutdown_racing_submit_does_not_cancel_the_dispatched_job() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "x,y\n1,2\n").unwrap();

        let repository = Arc::new(InMemoryJobRepository::default());
        let schema = Arc::new(NoopSchema::default());
        let loader = Arc::new(NoopBulkLoader::default());
        let orchestrator = Arc::new(Orchestrator::new(repository.clone(), schema, loader.clone()));

        let job_id = orchestrator.create_job(dir.path().to_string_lossy().to_string()).await.unwrap();

        let (queue, consumer) = JobQueue::start(orchestrator);
        queue.submit(job_id, "irrelevant".to_string());
        queue.shutdown();
        consumer.await.unwrap();

        let job = repository.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(domain::job::JobStatus::Completed, job.status);

        let files = repository.get_job_files(job_id).await.unwrap();
        assert!(files.iter().all(|f| f.status == domain::job::JobFileStatus::Completed));
        assert!(loader.tables.lock().unwrap().contains_key("TB_a"));
    }
}
