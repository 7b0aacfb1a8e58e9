//! In-process job queue with a global concurrency ceiling.
//!
//! Jobs enter either through [`JobQueue::enqueue`] right after submission or
//! through the periodic recovery scan, which re-admits every `queued` record
//! in the store that is neither pending nor active here. That scan is what
//! picks up work a crashed process left behind.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::jobs::events::QueueEvent;
use crate::jobs::model::{JobStatus, QueueJob};
use crate::jobs::runner::{JobOutcome, JobRunner};
use crate::jobs::store::{JobStore, ListFilter};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub recovery_batch_size: i64,
    /// How often `stop` re-checks the active set while draining.
    pub drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval: Duration::from_millis(5000),
            recovery_batch_size: 10,
            drain_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub active_workers: usize,
    pub concurrency: usize,
    pub saturation: f64,
    /// Terminal counts since this process started.
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
    pub started: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueJob>,
    active: HashSet<Uuid>,
}

impl QueueState {
    fn knows(&self, id: Uuid) -> bool {
        self.active.contains(&id) || self.pending.iter().any(|j| j.id == id)
    }
}

struct Inner {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    runner: JobRunner,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    terminal_sinks: Mutex<Vec<mpsc::UnboundedSender<QueueEvent>>>,
    running: AtomicBool,
    paused: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobQueue {
    pub fn new(config: QueueConfig, store: Arc<dyn JobStore>, runner: JobRunner) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config: QueueConfig {
                    concurrency: config.concurrency.max(1),
                    ..config
                },
                store,
                runner,
                state: Mutex::new(QueueState::default()),
                events,
                terminal_sinks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Completed and failed events only, on an unbounded channel. Unlike
    /// [`JobQueue::subscribe`], a slow consumer never loses one.
    pub fn terminal_events(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.terminal_sinks).push(tx);
        rx
    }

    /// Admits a job unless it is already pending or active. Returns whether it was added.
    pub fn enqueue(&self, job: QueueJob) -> bool {
        let added = admit(&self.inner, job);
        dispatch(&self.inner);
        added
    }

    /// Starts the recovery scan. The first scan runs immediately.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            concurrency = self.inner.config.concurrency,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            "job queue started"
        );

        let inner = self.inner.clone();
        let handle = tokio::spawn(poll_loop(inner));
        *lock(&self.inner.poller) = Some(handle);
    }

    /// Stops scanning and waits for every active job to finish, then releases
    /// the executor's resources. Pending jobs stay `queued` in the store.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = lock(&self.inner.poller).take() {
            handle.abort();
        }

        let active = self.active_count();
        tracing::info!(active, "waiting for active jobs to complete");
        while self.active_count() > 0 {
            tokio::time::sleep(self.inner.config.drain_interval).await;
        }

        self.inner.runner.executor().shutdown().await;
        tracing::info!("job queue stopped");
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        let _ = self.inner.events.send(QueueEvent::QueuePaused);
        tracing::info!("job queue paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        let _ = self.inner.events.send(QueueEvent::QueueResumed);
        tracing::info!("job queue resumed");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.state).active.len()
    }

    pub fn stats(&self) -> QueueStats {
        let (queued, running) = {
            let state = lock(&self.inner.state);
            (state.pending.len(), state.active.len())
        };
        let concurrency = self.inner.config.concurrency;

        QueueStats {
            queued,
            running,
            active_workers: running,
            concurrency,
            saturation: running as f64 / concurrency as f64,
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            paused: self.inner.paused.load(Ordering::SeqCst),
            started: self.is_running(),
        }
    }
}

fn admit(inner: &Inner, job: QueueJob) -> bool {
    {
        let mut state = lock(&inner.state);
        if state.knows(job.id) {
            return false;
        }
        state.pending.push_back(job.clone());
    }

    tracing::debug!(job_id = %job.id, job_type = job.job_type.as_str(), "job enqueued");
    let _ = inner.events.send(QueueEvent::JobQueued(job));
    true
}

/// Moves pending jobs into free slots. Slot accounting happens under one lock
/// acquisition so two callers can never both admit past the ceiling.
fn dispatch(inner: &Arc<Inner>) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }
    // Slots freed while the runtime is being torn down are not refilled.
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };

    let ready: Vec<QueueJob> = {
        let mut state = lock(&inner.state);
        let mut ready = Vec::new();
        while state.active.len() < inner.config.concurrency {
            let Some(job) = state.pending.pop_front() else {
                break;
            };
            state.active.insert(job.id);
            ready.push(job);
        }
        ready
    };

    for job in ready {
        let slot = ActiveSlot {
            inner: inner.clone(),
            job_id: job.id,
        };
        runtime.spawn(async move {
            process(&slot.inner, job).await;
            drop(slot);
        });
    }
}

/// Frees the job's slot and refills it, even if processing unwinds.
struct ActiveSlot {
    inner: Arc<Inner>,
    job_id: Uuid,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        lock(&self.inner.state).active.remove(&self.job_id);
        dispatch(&self.inner);
    }
}

async fn process(inner: &Inner, job: QueueJob) {
    match inner.runner.claim(&job).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(job_id = %job.id, "job is no longer queued, skipping");
            return;
        }
        Err(e) => {
            // Record stays queued; the next scan retries it.
            tracing::warn!(job_id = %job.id, error = %e, "failed to mark job running");
            return;
        }
    }

    tracing::info!(job_id = %job.id, site = %job.site, "job started");
    let _ = inner.events.send(QueueEvent::JobStarted(job.clone()));

    match inner.runner.execute(&job).await {
        Ok(JobOutcome::Completed(summary)) => {
            inner.completed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                job_id = %job.id,
                items_extracted = summary.items_extracted,
                duration_ms = summary.duration_ms,
                "job completed"
            );
            publish_terminal(inner, QueueEvent::JobCompleted { job, summary });
        }
        Ok(JobOutcome::Failed(error)) => {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = %job.id, error = %error, "job failed");
            publish_terminal(inner, QueueEvent::JobFailed { job, error });
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "failed to record job outcome");
        }
    }
}

fn publish_terminal(inner: &Inner, event: QueueEvent) {
    lock(&inner.terminal_sinks).retain(|sink| sink.send(event.clone()).is_ok());
    let _ = inner.events.send(event);
}

async fn poll_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if inner.paused.load(Ordering::SeqCst) {
            continue;
        }
        recover(&inner).await;
    }
}

async fn recover(inner: &Arc<Inner>) -> usize {
    let filter = ListFilter {
        oldest_first: true,
        ..ListFilter::with_status(JobStatus::Queued, inner.config.recovery_batch_size)
    };

    let admitted = match inner.store.list_jobs(&filter).await {
        Ok(jobs) => jobs
            .iter()
            .filter(|job| admit(inner, job.to_queue_job()))
            .count(),
        Err(e) => {
            tracing::warn!(error = %e, "recovery scan failed");
            0
        }
    };

    if admitted > 0 {
        tracing::info!(admitted, "recovery scan admitted queued jobs");
    }
    dispatch(inner);
    admitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::MemoryJobStore;
    use crate::jobs::model::{Job, JobType, NewJob, OutputFormat};
    use crate::jobs::runner::JobExecutor;
    use crate::scrape::adapter::{AdapterError, AdapterRegistry};
    use crate::scrape::fakes::{FakeAdapter, FakeLauncher};
    use crate::scrape::worker::{JobWorker, ScrapeError, WorkerConfig, WorkerResult};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast::Receiver;

    #[derive(Default)]
    struct RecordingExecutor {
        delay: Duration,
        current: AtomicUsize,
        max_seen: AtomicUsize,
        calls: Mutex<Vec<Uuid>>,
        shutdowns: AtomicUsize,
    }

    impl RecordingExecutor {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Uuid> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn execute(&self, job: &QueueJob) -> Result<WorkerResult, ScrapeError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            lock(&self.calls).push(job.id);

            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if job.parameters.get("panic").is_some() {
                panic!("executor crashed");
            }
            if job.parameters.get("fail").is_some() {
                return Err(AdapterError::Extraction("no cards".into()).into());
            }

            Ok(WorkerResult {
                items: vec![],
                pages_scraped: 1,
                items_extracted: 0,
                result_file_path: PathBuf::from(format!("data/{}.json", job.id)),
            })
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(concurrency: usize, poll_ms: u64) -> QueueConfig {
        QueueConfig {
            concurrency,
            poll_interval: Duration::from_millis(poll_ms),
            recovery_batch_size: 10,
            drain_interval: Duration::from_millis(5),
        }
    }

    fn queue_with(
        cfg: QueueConfig,
        executor: Arc<dyn JobExecutor>,
    ) -> (JobQueue, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let runner = JobRunner::new(store.clone(), executor);
        (JobQueue::new(cfg, store.clone(), runner), store)
    }

    async fn create(store: &MemoryJobStore, parameters: Value) -> Job {
        store
            .create_job(NewJob {
                site: "x".into(),
                job_type: JobType::Scrape,
                parameters,
                format: OutputFormat::Json,
                headless: true,
                webhook_url: None,
            })
            .await
            .unwrap()
    }

    async fn wait_terminal(rx: &mut Receiver<QueueEvent>, n: usize, within: Duration) -> Vec<QueueEvent> {
        let mut out = Vec::new();
        tokio::time::timeout(within, async {
            while out.len() < n {
                match rx.recv().await {
                    Ok(event) if event.is_terminal() => out.push(event),
                    Ok(_) => {}
                    Err(e) => panic!("event channel error: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for terminal events");
        out
    }

    #[tokio::test]
    async fn concurrency_ceiling_holds_under_burst() {
        let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(20)));
        let (queue, store) = queue_with(config(2, 10_000), exec.clone());
        let mut rx = queue.subscribe();
        queue.start();

        for _ in 0..10 {
            let job = create(&store, json!({})).await;
            queue.enqueue(job.to_queue_job());
            assert!(queue.active_count() <= 2);
        }

        wait_terminal(&mut rx, 10, Duration::from_secs(5)).await;
        assert_eq!(exec.calls().len(), 10);
        assert_eq!(exec.max_seen.load(Ordering::SeqCst), 2);
        queue.stop().await;
    }

    #[tokio::test]
    async fn duplicate_enqueue_dispatches_once() {
        let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(30)));
        let (queue, store) = queue_with(config(1, 5), exec.clone());
        let mut rx = queue.subscribe();

        let job = create(&store, json!({})).await;
        assert!(queue.enqueue(job.to_queue_job()));
        assert!(!queue.enqueue(job.to_queue_job()));
        queue.start();
        assert!(!queue.enqueue(job.to_queue_job()));

        wait_terminal(&mut rx, 1, Duration::from_secs(2)).await;
        // Several scans pass while the record is running and after it completed.
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(exec.calls(), vec![job.id]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn recovery_scan_picks_up_orphaned_jobs_within_one_interval() {
        let exec = Arc::new(RecordingExecutor::default());
        let (queue, store) = queue_with(config(2, 100), exec.clone());
        let mut rx = queue.subscribe();
        queue.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Left behind by a previous process: in the store, never enqueued here.
        let orphan = create(&store, json!({})).await;

        wait_terminal(&mut rx, 1, Duration::from_millis(250)).await;
        assert_eq!(exec.calls(), vec![orphan.id]);
        let record = store.get_job(orphan.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        queue.stop().await;
    }

    #[tokio::test]
    async fn dispatch_is_fifo() {
        let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(2)));
        let (queue, store) = queue_with(config(1, 10_000), exec.clone());
        let mut rx = queue.subscribe();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = create(&store, json!({})).await;
            ids.push(job.id);
            queue.enqueue(job.to_queue_job());
        }
        assert_eq!(queue.pending_count(), 4);

        queue.start();
        wait_terminal(&mut rx, 4, Duration::from_secs(2)).await;
        assert_eq!(exec.calls(), ids);
        queue.stop().await;
    }

    #[tokio::test]
    async fn recovery_preserves_creation_order() {
        let exec = Arc::new(RecordingExecutor::default());
        let (queue, store) = queue_with(config(1, 10_000), exec.clone());
        let mut rx = queue.subscribe();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(create(&store, json!({})).await.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        queue.start();
        wait_terminal(&mut rx, 3, Duration::from_secs(2)).await;
        assert_eq!(exec.calls(), ids);
        queue.stop().await;
    }

    #[tokio::test]
    async fn failed_job_is_not_retried() {
        let exec = Arc::new(RecordingExecutor::default());
        let (queue, store) = queue_with(config(1, 5), exec.clone());
        let mut rx = queue.subscribe();
        queue.start();

        let job = create(&store, json!({ "fail": true })).await;
        queue.enqueue(job.to_queue_job());

        let events = wait_terminal(&mut rx, 1, Duration::from_secs(2)).await;
        assert!(matches!(&events[0], QueueEvent::JobFailed { error, .. } if error.contains("no cards")));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(exec.calls().len(), 1);

        let record = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(queue.stats().failed, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn panicking_job_does_not_take_down_the_queue() {
        let exec = Arc::new(RecordingExecutor::default());
        let (queue, store) = queue_with(config(1, 10_000), exec.clone());
        let mut rx = queue.subscribe();
        queue.start();

        let bad = create(&store, json!({ "panic": true })).await;
        let good = create(&store, json!({})).await;
        queue.enqueue(bad.to_queue_job());
        queue.enqueue(good.to_queue_job());

        wait_terminal(&mut rx, 2, Duration::from_secs(2)).await;

        let bad = store.get_job(bad.id).await.unwrap().unwrap();
        let good = store.get_job(good.id).await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(good.status, JobStatus::Completed);
        assert_eq!(queue.active_count(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_active_jobs() {
        let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(50)));
        let (queue, store) = queue_with(config(2, 10_000), exec.clone());
        queue.start();

        let job = create(&store, json!({})).await;
        queue.enqueue(job.to_queue_job());
        assert_eq!(queue.active_count(), 1);

        queue.stop().await;

        assert_eq!(queue.active_count(), 0);
        assert_eq!(exec.shutdowns.load(Ordering::SeqCst), 1);
        let record = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);

        // Stopped queues hold new work as pending.
        let later = create(&store, json!({})).await;
        queue.enqueue(later.to_queue_job());
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn paused_queue_skips_recovery_scans() {
        let exec = Arc::new(RecordingExecutor::default());
        let (queue, store) = queue_with(config(1, 10), exec.clone());
        let mut rx = queue.subscribe();
        queue.pause();
        queue.start();

        create(&store, json!({})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(exec.calls().is_empty());
        assert!(queue.stats().paused);

        queue.resume();
        wait_terminal(&mut rx, 1, Duration::from_secs(1)).await;
        assert_eq!(exec.calls().len(), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn terminal_feed_survives_a_lagging_broadcast() {
        let exec = Arc::new(RecordingExecutor::default());
        let (queue, store) = queue_with(config(8, 10_000), exec.clone());
        let mut lagging = queue.subscribe();
        let mut terminal = queue.terminal_events();
        queue.start();

        let total = EVENT_CAPACITY + 50;
        for _ in 0..total {
            let job = create(&store, json!({})).await;
            queue.enqueue(job.to_queue_job());
        }

        let mut seen = HashSet::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while seen.len() < total {
                let event = terminal.recv().await.expect("feed open");
                assert!(event.is_terminal(), "{event:?}");
                seen.insert(event.job().map(|j| j.id));
            }
        })
        .await
        .expect("every terminal event arrives");

        assert!(matches!(
            lagging.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        queue.stop().await;
    }

    #[tokio::test]
    async fn stats_report_saturation() {
        let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(100)));
        let (queue, store) = queue_with(config(4, 10_000), exec.clone());
        queue.start();

        for _ in 0..6 {
            let job = create(&store, json!({})).await;
            queue.enqueue(job.to_queue_job());
        }

        let stats = queue.stats();
        assert_eq!(stats.running, 4);
        assert_eq!(stats.active_workers, 4);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.concurrency, 4);
        assert!((stats.saturation - 1.0).abs() < f64::EPSILON);
        assert!(stats.started);
        queue.stop().await;
    }

    #[tokio::test]
    async fn scrape_job_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let worker = JobWorker::new(
            store.clone(),
            AdapterRegistry::new().with("x", Arc::new(FakeAdapter::new(5, 10))),
            Arc::new(FakeLauncher::new()),
            WorkerConfig {
                data_dir: dir.path().to_path_buf(),
                rate_limiting: false,
                ..Default::default()
            },
        );
        let runner = JobRunner::new(store.clone(), Arc::new(worker));
        let queue = JobQueue::new(config(2, 10_000), store.clone(), runner);
        let mut rx = queue.subscribe();
        queue.start();

        let job = create(&store, json!({ "maxPages": 3 })).await;
        queue.enqueue(job.to_queue_job());

        let events = wait_terminal(&mut rx, 1, Duration::from_secs(5)).await;
        let QueueEvent::JobCompleted { summary, .. } = &events[0] else {
            panic!("expected completion, got {:?}", events[0]);
        };
        assert_eq!(summary.items.len(), 30);

        let record = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.pages_scraped, 3);
        assert_eq!(record.items_extracted, 30);

        let path = record.result_file_path.unwrap();
        assert!(path.ends_with(&format!("{}.json", job.id)));
        let items: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(items.len(), 30);

        queue.stop().await;
    }
}
