//! Job definition and state management.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Job unique identifier.
pub type JobId = Uuid;

/// Job data payload as stored by the broker.
pub type JobData = serde_json::Value;

/// A payload type bound to one queue.
///
/// Submitters and consumers that share the type agree on both the queue name
/// and the payload shape at compile time.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use taskline_queue::JobPayload;
///
/// #[derive(Serialize, Deserialize)]
/// struct WelcomeEmail {
///     to: String,
/// }
///
/// impl JobPayload for WelcomeEmail {
///     const QUEUE: &'static str = "emails";
/// }
///
/// assert_eq!(WelcomeEmail::QUEUE, "emails");
/// ```
pub trait JobPayload: Serialize + DeserializeOwned + Send + 'static {
    /// Queue this payload is submitted to and consumed from.
    const QUEUE: &'static str;
}

/// Job priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum JobPriority {
    /// Lowest priority
    Low = 0,
    /// Normal priority (default)
    #[default]
    Normal = 1,
    /// High priority
    High = 2,
    /// Critical priority
    Critical = 3,
}

impl JobPriority {
    /// All priorities, most urgent first.
    pub const DESCENDING: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    /// Lowercase name used in broker keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }
}

/// Per-job delivery options.
///
/// Options are forwarded to the broker exactly as given; nothing fills in
/// defaults on the way. Absent fields fall back to whatever the broker does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Deferred start.
    #[serde(default, with = "option_millis", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,

    /// Maximum number of attempts, the first run included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Relative ordering weight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<JobPriority>,
}

impl JobOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay the first delivery.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the maximum number of attempts.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A submission on its way to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Serialized payload
    pub data: JobData,
    /// Options as given by the submitter
    pub options: Option<JobOptions>,
}

impl NewJob {
    /// Serialize a payload into a submission.
    pub fn new<T: Serialize + ?Sized>(payload: &T, options: Option<JobOptions>) -> QueueResult<Self> {
        let data = serde_json::to_value(payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Self { data, options })
    }
}

/// What the submitter gets back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Broker-assigned identifier
    pub id: JobId,
    /// Queue the job was submitted to
    pub queue: String,
}

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Ready to be fetched
    Waiting,
    /// Scheduled for later (initial delay or retry backoff)
    Delayed,
    /// Handed to a consumer
    Active,
    /// Consumer succeeded
    Completed,
    /// Attempts exhausted, parked in the dead letter set
    Failed,
}

/// A job as the broker stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Queue name
    pub queue: String,

    /// Job payload data
    pub data: JobData,

    /// Options exactly as submitted
    pub options: Option<JobOptions>,

    /// Current state
    pub state: JobState,

    /// Number of deliveries so far
    pub attempts: u32,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the job becomes deliverable
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When the latest delivery started
    pub started_at: Option<DateTime<Utc>>,

    /// When the job completed or failed for good
    pub finished_at: Option<DateTime<Utc>>,

    /// Last consumer error
    pub failed_reason: Option<String>,

    /// Consumer output on success
    pub return_value: Option<JobData>,
}

impl Job {
    /// Materialize a submission on the broker side.
    pub fn from_new(queue: impl Into<String>, new_job: NewJob) -> QueueResult<Self> {
        let created_at = Utc::now();

        let scheduled_at = match new_job.options.and_then(|o| o.delay) {
            Some(delay) if !delay.is_zero() => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| QueueError::InvalidOptions(format!("delay: {}", e)))?;
                let at = created_at
                    .checked_add_signed(delay)
                    .ok_or_else(|| QueueError::InvalidOptions("delay out of range".into()))?;
                Some(at)
            }
            _ => None,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            data: new_job.data,
            options: new_job.options,
            state: if scheduled_at.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts: 0,
            created_at,
            scheduled_at,
            started_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
        })
    }

    /// Handle for the submitter.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            queue: self.queue.clone(),
        }
    }

    /// Priority, normal when the submitter gave none.
    pub fn priority(&self) -> JobPriority {
        self.options.and_then(|o| o.priority).unwrap_or_default()
    }

    /// Attempt budget. The broker applies a single attempt when none was given.
    pub fn max_attempts(&self) -> u32 {
        self.options.and_then(|o| o.attempts).unwrap_or(1).max(1)
    }

    /// Check if the job is ready to be processed.
    pub fn is_ready(&self) -> bool {
        match self.scheduled_at {
            Some(at) => Utc::now() >= at,
            None => true,
        }
    }

    /// Check if another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts()
    }

    /// Mark job as handed to a consumer.
    pub fn start_processing(&mut self) {
        self.state = JobState::Active;
        self.started_at = Some(Utc::now());
        self.scheduled_at = None;
        self.attempts += 1;
    }

    /// Mark job as completed.
    pub fn complete(&mut self, return_value: JobData) {
        self.state = JobState::Completed;
        self.return_value = Some(return_value);
        self.finished_at = Some(Utc::now());
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// Returns `true` when the job was rescheduled with backoff, `false` when
    /// its attempts are exhausted.
    pub fn fail(&mut self, reason: String) -> bool {
        self.failed_reason = Some(reason);

        if self.can_retry() {
            self.state = JobState::Delayed;
            self.scheduled_at = Some(Utc::now() + self.backoff_delay());
            true
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(Utc::now());
            false
        }
    }

    /// Calculate backoff delay for retry.
    pub fn backoff_delay(&self) -> chrono::Duration {
        // Exponential backoff: 2^(attempts-1) seconds
        let seconds = 2_i64.pow(self.attempts.saturating_sub(1).min(12));
        chrono::Duration::seconds(seconds.min(3600)) // Max 1 hour
    }
}

mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
