//! In-process test double for the broker seam.
//!
//! Meant for tests and local runs of code built on
//! [`JobQueues`](crate::JobQueues), not for production traffic: nothing is
//! persisted and every submission, ack and failure report is recorded
//! verbatim for inspection, so those logs grow for the life of the process.
//!
//! Delivery follows the Redis broker: priorities, FIFO within a priority,
//! delays, attempt budgets with exponential backoff, a dead letter set,
//! stalled-job recovery, and finished jobs dropped once they are older than
//! the retention time. Storage outlives individual clients, so closing and
//! reopening a queue name sees the same jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::broker::{BrokerConnector, JobCounts, QueueBroker, QueueConfig, STALLED_REASON};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobHandle, JobId, JobPriority, JobState, NewJob};

#[derive(Default)]
struct Store {
    jobs: HashMap<JobId, Job>,
    // (priority rank, sequence) -> job, smallest first
    waiting: BTreeMap<(u8, u64), JobId>,
    delayed: Vec<(DateTime<Utc>, JobId)>,
    submissions: Vec<NewJob>,
    acks: Vec<(JobId, JobData)>,
    nacks: Vec<(JobId, String)>,
}

/// Shared storage for one queue name.
#[derive(Default)]
pub struct MemoryQueue {
    store: Mutex<Store>,
    sequence: AtomicU64,
}

impl MemoryQueue {
    fn rank(priority: JobPriority) -> u8 {
        JobPriority::Critical as u8 - priority as u8
    }

    fn enqueue(&self, store: &mut Store, job: &Job) {
        match job.scheduled_at {
            Some(at) if !job.is_ready() => store.delayed.push((at, job.id)),
            _ => {
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                store.waiting.insert((Self::rank(job.priority()), seq), job.id);
            }
        }
    }

    fn promote_delayed(&self, store: &mut Store) {
        let now = Utc::now();
        let (due, later): (Vec<_>, Vec<_>) =
            std::mem::take(&mut store.delayed).into_iter().partition(|(at, _)| *at <= now);
        store.delayed = later;

        let mut due = due;
        due.sort_by_key(|(at, _)| *at);
        for (_, job_id) in due {
            let promoted = store.jobs.get_mut(&job_id).map(|job| {
                job.state = JobState::Waiting;
                job.priority()
            });
            if let Some(priority) = promoted {
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                store.waiting.insert((Self::rank(priority), seq), job_id);
            }
        }
    }

    fn recover_stalled(&self, store: &mut Store, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }

        let now = Utc::now();
        let mut stalled: Vec<(DateTime<Utc>, JobId)> = store
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active)
            .filter_map(|job| job.started_at.map(|at| (at, job.id)))
            .filter(|(at, _)| older_than(now, *at, timeout))
            .collect();
        stalled.sort_by_key(|(at, _)| *at);

        for (_, job_id) in stalled {
            let Some(job) = store.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.fail(STALLED_REASON.to_string()) {
                let job = job.clone();
                self.enqueue(store, &job);
            }
        }
    }

    fn evict_finished(store: &mut Store, retention: Duration) {
        let now = Utc::now();
        store.jobs.retain(|_, job| {
            let finished = matches!(job.state, JobState::Completed | JobState::Failed);
            !(finished && job.finished_at.is_some_and(|at| older_than(now, at, retention)))
        });
    }

    /// Every submission received, in order, exactly as submitted.
    pub fn submissions(&self) -> Vec<NewJob> {
        self.store.lock().submissions.clone()
    }

    /// Every acknowledgment received.
    pub fn acks(&self) -> Vec<(JobId, JobData)> {
        self.store.lock().acks.clone()
    }

    /// Every failure report received.
    pub fn nacks(&self) -> Vec<(JobId, String)> {
        self.store.lock().nacks.clone()
    }

    /// A snapshot of one job.
    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.store.lock().jobs.get(&job_id).cloned()
    }

    /// Make every delayed job deliverable now.
    pub fn release_delayed(&self) {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        for (at, job_id) in store.delayed.iter_mut() {
            *at = Utc::now();
            if let Some(job) = store.jobs.get_mut(job_id) {
                job.scheduled_at = Some(*at);
            }
        }
    }
}

fn older_than(now: DateTime<Utc>, at: DateTime<Utc>, age: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .is_ok_and(|elapsed| elapsed > age)
}

/// A client handle on a [`MemoryQueue`].
pub struct MemoryBroker {
    name: String,
    config: QueueConfig,
    queue: Arc<MemoryQueue>,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// A standalone broker with its own storage.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(QueueConfig::new(name))
    }

    /// A standalone broker with its own storage and the given settings.
    pub fn with_config(config: QueueConfig) -> Self {
        Self::attach(config, Arc::new(MemoryQueue::default()))
    }

    fn attach(config: QueueConfig, queue: Arc<MemoryQueue>) -> Self {
        Self {
            name: config.queue_name.clone(),
            config,
            queue,
            closed: AtomicBool::new(false),
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> Arc<MemoryQueue> {
        self.queue.clone()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn push(&self, new_job: NewJob) -> QueueResult<JobHandle> {
        self.ensure_open()?;

        let job = Job::from_new(&self.name, new_job.clone())?;
        let mut store = self.queue.store.lock();
        store.submissions.push(new_job);
        self.queue.enqueue(&mut store, &job);
        let handle = job.handle();
        store.jobs.insert(job.id, job);
        Ok(handle)
    }

    async fn fetch(&self) -> QueueResult<Option<Job>> {
        self.ensure_open()?;

        let mut store = self.queue.store.lock();
        self.queue.recover_stalled(&mut store, self.config.stalled_timeout);
        self.queue.promote_delayed(&mut store);

        while let Some((_, job_id)) = store.waiting.pop_first() {
            if let Some(job) = store.jobs.get_mut(&job_id) {
                job.start_processing();
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn ack(&self, job_id: JobId, return_value: JobData) -> QueueResult<()> {
        self.ensure_open()?;

        let mut store = self.queue.store.lock();
        let job = store.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        job.complete(return_value.clone());
        store.acks.push((job_id, return_value));
        MemoryQueue::evict_finished(&mut store, self.config.retention_time);
        Ok(())
    }

    async fn nack(&self, job_id: JobId, reason: String) -> QueueResult<()> {
        self.ensure_open()?;

        let mut store = self.queue.store.lock();
        let job = store.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        if job.fail(reason.clone()) {
            let job = job.clone();
            self.queue.enqueue(&mut store, &job);
        }
        store.nacks.push((job_id, reason));
        MemoryQueue::evict_finished(&mut store, self.config.retention_time);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.ensure_open()?;
        Ok(self.queue.job(job_id))
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        self.ensure_open()?;

        let store = self.queue.store.lock();
        let mut counts = JobCounts::default();
        for job in store.jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out [`MemoryBroker`]s.
///
/// Records every `open` call together with the broker address it was given.
#[derive(Default)]
pub struct MemoryBrokerConnector {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    opens: Mutex<Vec<(String, String)>>,
    holds: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl MemoryBrokerConnector {
    /// Empty connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage for a queue name, if it was ever opened.
    pub fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues.lock().get(name).cloned()
    }

    /// `(queue name, broker url)` for every client opened so far.
    pub fn opens(&self) -> Vec<(String, String)> {
        self.opens.lock().clone()
    }

    /// Number of clients opened for one queue name.
    pub fn open_count(&self, name: &str) -> usize {
        self.opens.lock().iter().filter(|(n, _)| n == name).count()
    }

    /// Make opens for `name` block until a permit is added to the returned
    /// semaphore. One permit releases every later open too.
    pub fn hold_opens(&self, name: &str) -> Arc<Semaphore> {
        self.holds
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBrokerConnector {
    async fn open(&self, url: &str, config: QueueConfig) -> QueueResult<Arc<dyn QueueBroker>> {
        let name = config.queue_name.clone();
        self.opens.lock().push((name.clone(), url.to_string()));

        let hold = self.holds.lock().get(&name).cloned();
        if let Some(hold) = hold {
            let _permit = hold
                .acquire()
                .await
                .map_err(|_| QueueError::Closed(name.clone()))?;
        }

        let queue = self.queues.lock().entry(name).or_default().clone();
        Ok(Arc::new(MemoryBroker::attach(config, queue)))
    }
}
