//! Callback delivery
//!
//! Operation outcomes are posted to an external listener in the background.
//! A single dispatcher task owns every pending job: jobs arrive through a
//! channel, attempts run concurrently in a `JoinSet`, and failed attempts go
//! back onto a timer heap with exponential backoff. A `CallbackJob` is never
//! mutated in place; each attempt produces the next record.
//!
//! Delivery failures never reach the request that triggered them. A job that
//! runs out of attempts is logged with its full payload and counted in the
//! `DeliveryReport`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use crate::metadata::Metadata;
use crate::orchestrator::ChildFailure;
use crate::providers::retry::BackoffConfig;
use crate::providers::{ErrorReport, ProviderError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Total delivery attempts per job, the first one included
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Per-attempt timeout
    pub timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig {
                base_delay_ms: 1000,
                max_delay_ms: 60_000,
                ..BackoffConfig::default()
            },
            timeout_secs: 10,
        }
    }
}

impl CallbackConfig {
    pub fn validate(&mut self) {
        self.max_attempts = self.max_attempts.clamp(1, 20);
        self.timeout_secs = self.timeout_secs.clamp(1, 300);
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CallbackOutcome {
    Success,
    Failure { error: ErrorReport },
}

/// Body posted to the callback URL
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackPayload {
    /// `create`, `update`, `delete`, `create_folder`, `move`, `copy`, `download`
    pub action: String,
    /// `<provider>/<path>` of the source (or only) object
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub outcome: CallbackOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_children: Vec<ChildFailure>,
    pub time: DateTime<Utc>,
}

impl CallbackPayload {
    pub fn new(action: &str, source: String, outcome: Result<Option<Metadata>, &ProviderError>) -> Self {
        let (outcome, metadata) = match outcome {
            Ok(metadata) => (CallbackOutcome::Success, metadata),
            Err(e) => (CallbackOutcome::Failure { error: e.report() }, None),
        };
        Self {
            action: action.to_string(),
            source,
            destination: None,
            outcome,
            metadata,
            failed_children: Vec::new(),
            time: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: String) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_failed_children(mut self, failed: Vec<ChildFailure>) -> Self {
        self.failed_children = failed;
        self
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Delivered,
    Exhausted,
}

/// One notification and where it stands. Each attempt yields a new record.
#[derive(Debug, Clone)]
pub struct CallbackJob {
    pub id: Uuid,
    pub url: String,
    pub payload: CallbackPayload,
    /// Attempts made so far
    pub attempts: u32,
    pub next_attempt_at: Instant,
    pub state: JobState,
}

impl CallbackJob {
    pub fn new(url: &str, payload: CallbackPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            payload,
            attempts: 0,
            next_attempt_at: Instant::now(),
            state: JobState::Pending,
        }
    }

    pub fn delivered(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            state: JobState::Delivered,
            ..self.clone()
        }
    }

    /// Record a failed attempt: reschedule, or exhaust once the budget is spent
    pub fn failed(&self, config: &CallbackConfig) -> Self {
        let attempts = self.attempts + 1;
        if attempts >= config.max_attempts {
            return Self {
                attempts,
                state: JobState::Exhausted,
                ..self.clone()
            };
        }
        Self {
            attempts,
            next_attempt_at: Instant::now() + config.backoff.delay(attempts - 1),
            state: JobState::Pending,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CallbackTransport: Send + Sync {
    /// Deliver once; any error counts as a failed attempt
    async fn deliver(&self, url: &str, payload: &CallbackPayload) -> Result<(), ProviderError>;
}

/// POSTs the payload as JSON; only 2xx counts as delivered
pub struct HttpCallbackTransport {
    client: Client,
}

impl HttpCallbackTransport {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Backend(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackTransport {
    async fn deliver(&self, url: &str, payload: &CallbackPayload) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("callback", &e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProviderError::BackendUnavailable(format!(
                "callback listener answered {}",
                status
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Delivery totals since the dispatcher started
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub attempts: u64,
    /// Jobs that ran out of attempts, in their final state
    pub exhausted: Vec<CallbackJob>,
}

enum Command {
    Enqueue(CallbackJob),
    Shutdown,
}

/// Cheap handle used by request handlers to enqueue jobs
#[derive(Clone)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl CallbackQueue {
    /// Queue a notification; never blocks and never fails the caller
    pub fn enqueue(&self, url: &str, payload: CallbackPayload) {
        let job = CallbackJob::new(url, payload);
        if let Err(mpsc::error::SendError(Command::Enqueue(job))) = self.tx.send(Command::Enqueue(job)) {
            tracing::error!(
                "[Callback] Dispatcher stopped, dropping {} for {}: {}",
                job.id,
                job.url,
                payload_json(&job.payload)
            );
        }
    }
}

pub struct CallbackDispatcher {
    queue: CallbackQueue,
    report: Arc<Mutex<DeliveryReport>>,
    task: JoinHandle<()>,
}

impl CallbackDispatcher {
    /// Start the dispatcher task on the current runtime
    pub fn spawn(config: CallbackConfig, transport: Arc<dyn CallbackTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let report = Arc::new(Mutex::new(DeliveryReport::default()));
        let worker = Worker {
            config,
            transport,
            rx,
            report: report.clone(),
            timers: BinaryHeap::new(),
            waiting: HashMap::new(),
            sequence: 0,
            in_flight: JoinSet::new(),
        };
        Self {
            queue: CallbackQueue { tx },
            report,
            task: tokio::spawn(worker.run()),
        }
    }

    pub fn queue(&self) -> CallbackQueue {
        self.queue.clone()
    }

    /// Snapshot of the delivery totals
    pub fn report(&self) -> DeliveryReport {
        lock(&self.report).clone()
    }

    /// Stop accepting work, settle every pending job, and return the totals
    pub async fn shutdown(self) -> DeliveryReport {
        let _ = self.queue.tx.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!("[Callback] Dispatcher task failed: {}", e);
        }
        lock(&self.report).clone()
    }
}

fn lock(report: &Mutex<DeliveryReport>) -> std::sync::MutexGuard<'_, DeliveryReport> {
    match report.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn payload_json(payload: &CallbackPayload) -> String {
    serde_json::to_string(payload).unwrap_or_else(|e| format!("<unserializable payload: {}>", e))
}

struct Worker {
    config: CallbackConfig,
    transport: Arc<dyn CallbackTransport>,
    rx: mpsc::UnboundedReceiver<Command>,
    report: Arc<Mutex<DeliveryReport>>,
    /// Retry times, earliest first; `sequence` breaks ties in arrival order
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    waiting: HashMap<u64, CallbackJob>,
    sequence: u64,
    in_flight: JoinSet<(CallbackJob, Result<(), ProviderError>)>,
}

impl Worker {
    async fn run(mut self) {
        let mut accepting = true;
        loop {
            if !accepting && self.timers.is_empty() && self.in_flight.is_empty() {
                break;
            }
            let next_due = self.timers.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                command = self.rx.recv(), if accepting => match command {
                    Some(Command::Enqueue(job)) => self.attempt(job),
                    Some(Command::Shutdown) | None => accepting = false,
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => match joined {
                    Ok((job, result)) => self.settle(job, result),
                    Err(e) => tracing::error!("[Callback] Delivery task failed: {}", e),
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.release_due();
                }
            }
        }
        tracing::debug!("[Callback] Dispatcher stopped");
    }

    fn attempt(&mut self, job: CallbackJob) {
        let transport = self.transport.clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        lock(&self.report).attempts += 1;
        self.in_flight.spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.deliver(&job.url, &job.payload)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::BackendUnavailable(format!(
                    "callback timed out after {:?}",
                    timeout
                ))),
            };
            (job, result)
        });
    }

    fn settle(&mut self, job: CallbackJob, result: Result<(), ProviderError>) {
        match result {
            Ok(()) => {
                let job = job.delivered();
                tracing::info!(
                    "[Callback] Delivered {} ({}) to {} after {} attempt(s)",
                    job.id,
                    job.payload.action,
                    job.url,
                    job.attempts
                );
                lock(&self.report).delivered += 1;
            }
            Err(e) => {
                let next = job.failed(&self.config);
                match next.state {
                    JobState::Exhausted => {
                        let exhausted = ProviderError::CallbackDeliveryExhausted {
                            url: next.url.clone(),
                            attempts: next.attempts,
                        };
                        tracing::error!(
                            "[Callback] {} (job {}, last error: {}): {}",
                            exhausted,
                            next.id,
                            e,
                            payload_json(&next.payload)
                        );
                        lock(&self.report).exhausted.push(next);
                    }
                    _ => {
                        tracing::warn!(
                            "[Callback] Attempt {}/{} for {} failed: {}. Retrying at {:?}",
                            next.attempts,
                            self.config.max_attempts,
                            next.url,
                            e,
                            next.next_attempt_at
                        );
                        self.sequence += 1;
                        self.timers.push(Reverse((next.next_attempt_at, self.sequence)));
                        self.waiting.insert(self.sequence, next);
                    }
                }
            }
        }
    }

    fn release_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, seq))) = self.timers.peek().copied() {
            if at > now {
                break;
            }
            self.timers.pop();
            if let Some(job) = self.waiting.remove(&seq) {
                self.attempt(job);
            }
        }
    }
}
